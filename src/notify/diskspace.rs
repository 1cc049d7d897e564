//! Free space checks for the recording volume.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::ByteSize;

/// Fail unless the volume holding `dir` has at least `required` bytes free.
///
/// Blocking; call it off the async runtime. A zero requirement always passes.
pub fn ensure_free_space(dir: &Path, required: ByteSize) -> Result<()> {
    if required.is_zero() {
        return Ok(());
    }

    let available = fs2::available_space(dir)
        .with_context(|| format!("Failed to query free space of {:?}", dir))?;
    if available < required.as_u64() {
        bail!(
            "Not enough free space in {:?}: {} available, {} required",
            dir,
            ByteSize(available),
            required
        );
    }

    Ok(())
}

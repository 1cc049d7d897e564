use crate::config::Config;
use anyhow::Result;
use std::path::Path;

pub mod args;

pub use args::{Cli, CliCommand};

pub fn handle_rooms_command(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;

    if config.rooms.is_empty() {
        println!("No rooms configured.");
        println!("\nAdd [[rooms]] entries with an id and url to the config file.");
        return Ok(());
    }

    println!("Configured room(s): {}\n", config.rooms.len());

    for room in &config.rooms {
        println!("ID:   {}", room.id);
        if let Some(name) = &room.name {
            println!("Name: {}", name);
        }
        println!("URL:  {}", room.url);
        println!("---");
    }

    Ok(())
}

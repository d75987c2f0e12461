//! The server's pin file.
//!
//! One pin per line: `id,sender,x,y,z,category,name,quiet`. Fields are not escaped, so a name
//! containing a comma produces a line that can't be read back; such lines are skipped on load.

use std::{
    fmt::Display,
    fs::File,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use eyre::{Context, Result};

use super::pin::MapPin;
use crate::vector::Vec3;

/// A line of the pin file that doesn't describe a pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    pub line: usize,
    pub reason: String,
}

impl Display for MalformedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

impl std::error::Error for MalformedRecord {}

fn format_record(pin: &MapPin) -> String {
    format!(
        "{},{},{},{},{},{},{},{}",
        pin.sender_id,
        pin.sender_name,
        pin.position.x,
        pin.position.y,
        pin.position.z,
        pin.category,
        pin.name,
        if pin.keep_quiet { "True" } else { "False" }
    )
}

fn parse_record(number: usize, line: &str) -> Result<MapPin, MalformedRecord> {
    let malformed = |reason: String| MalformedRecord {
        line: number,
        reason,
    };

    let parts: Vec<&str> = line.split(',').collect();

    if parts.len() != 8 {
        return Err(malformed(format!("expected 8 fields, found {}", parts.len())));
    }

    let number_field = |index: usize, what: &str| {
        parts[index]
            .trim()
            .parse::<f32>()
            .map_err(|_| malformed(format!("bad {what} '{}'", parts[index])))
    };

    let keep_quiet = match parts[7].trim().to_ascii_lowercase().as_str() {
        "true" => true,
        "false" => false,
        other => return Err(malformed(format!("bad flag '{other}'"))),
    };

    Ok(MapPin {
        sender_id: parts[0]
            .trim()
            .parse()
            .map_err(|_| malformed(format!("bad sender id '{}'", parts[0])))?,
        sender_name: parts[1].to_string(),
        position: Vec3::new(
            number_field(2, "x")?,
            number_field(3, "y")?,
            number_field(4, "z")?,
        ),
        category: parts[5]
            .trim()
            .parse()
            .map_err(|_| malformed(format!("bad category '{}'", parts[5])))?,
        name: parts[6].to_string(),
        keep_quiet,
    })
}

pub struct PinStore {
    path: PathBuf,
}

impl PinStore {
    pub fn new(path: impl Into<PathBuf>) -> PinStore {
        PinStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every well-formed pin in the file, creating an empty file if there is none.
    /// Malformed lines are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<MapPin>> {
        if !self.path.exists() {
            log::info!("No pin file at {}, creating one.", self.path.display());

            File::create(&self.path)
                .wrap_err_with(|| format!("creating {}", self.path.display()))?;

            return Ok(vec![]);
        }

        let file =
            File::open(&self.path).wrap_err_with(|| format!("opening {}", self.path.display()))?;

        let mut pins = vec![];

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.wrap_err("reading pin file")?;

            if line.trim().is_empty() {
                continue;
            }

            match parse_record(index + 1, &line) {
                Ok(pin) => pins.push(pin),
                Err(err) => log::warn!("Skipping malformed pin record: {err}"),
            }
        }

        log::info!("Loaded {} map pins.", pins.len());
        Ok(pins)
    }

    /// Replaces the file's contents with `pins`. The new contents are written to a temporary file
    /// first, so a failed save leaves the old file intact.
    pub fn save_all(&self, pins: &[MapPin]) -> Result<()> {
        let temp = self.path.with_extension("tmp");

        {
            let mut file =
                File::create(&temp).wrap_err_with(|| format!("creating {}", temp.display()))?;

            for pin in pins {
                writeln!(file, "{}", format_record(pin))?;
            }

            file.sync_all()?;
        }

        std::fs::rename(&temp, &self.path)
            .wrap_err_with(|| format!("replacing {}", self.path.display()))?;

        log::info!("Saved {} map pins.", pins.len());
        Ok(())
    }
}

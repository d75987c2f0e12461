//! Map pins and their wire format.
//!
//! A pin is written as: origin id (`i64`), origin name, position (three `f32`s), category
//! (`i32`), pin name, suppress flag (one byte). Strings are a `u32` byte length followed by
//! UTF-8. Everything is little-endian.

use std::io::{Cursor, Read};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use eyre::{Context, Result};

use super::PeerId;
use crate::vector::{GridKey, Vec3};

/// One marker placed on the shared map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapPin {
    pub sender_id: PeerId,
    pub sender_name: String,
    pub position: Vec3,
    pub category: i32,
    pub name: String,

    /// Don't announce the pin when it arrives.
    pub keep_quiet: bool,
}

impl MapPin {
    /// Pins are deduplicated on their position snapped to a thousandth of a unit.
    const KEY_SCALE: f32 = 1000.0;

    pub fn key(&self) -> GridKey {
        GridKey::new(self.position, Self::KEY_SCALE)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        // Writes to a `Vec` can't fail.
        let _ = out.write_i64::<LE>(self.sender_id);
        write_string(out, &self.sender_name);
        write_vec3(out, self.position);
        let _ = out.write_i32::<LE>(self.category);
        write_string(out, &self.name);
        let _ = out.write_u8(self.keep_quiet as u8);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        self.write(&mut out);
        out
    }

    /// Reads a single pin from `reader`.
    pub fn read(reader: &mut impl Read) -> Result<MapPin> {
        Ok(MapPin {
            sender_id: reader.read_i64::<LE>().wrap_err("sender id")?,
            sender_name: read_string(reader).wrap_err("sender name")?,
            position: read_vec3(reader).wrap_err("position")?,
            category: reader.read_i32::<LE>().wrap_err("category")?,
            name: read_string(reader).wrap_err("pin name")?,
            keep_quiet: reader.read_u8().wrap_err("keep quiet flag")? != 0,
        })
    }

    /// Reads pins one after another from `payload`.
    pub fn read_each(payload: &[u8]) -> PinReader<'_> {
        PinReader {
            cursor: Cursor::new(payload),
            read: 0,
            failed: false,
        }
    }

    /// Reads pins until `payload` is exhausted.
    pub fn decode_all(payload: &[u8]) -> Result<Vec<MapPin>> {
        MapPin::read_each(payload).collect()
    }

    /// Reads the first pin in `payload`, ignoring anything after it.
    pub fn decode(payload: &[u8]) -> Result<MapPin> {
        MapPin::read(&mut Cursor::new(payload))
    }
}

/// Yields every pin in a payload. Stops after the first pin that can't be read.
pub struct PinReader<'a> {
    cursor: Cursor<&'a [u8]>,
    read: usize,
    failed: bool,
}

impl Iterator for PinReader<'_> {
    type Item = Result<MapPin>;

    fn next(&mut self) -> Option<Result<MapPin>> {
        if self.failed || self.cursor.position() as usize >= self.cursor.get_ref().len() {
            return None;
        }

        let pin = MapPin::read(&mut self.cursor)
            .wrap_err_with(|| format!("error reading pin {}", self.read));

        self.read += 1;
        self.failed = pin.is_err();

        Some(pin)
    }
}

/// Asks the server to remove the sender's pins near a position.
#[derive(Debug, Clone, PartialEq)]
pub struct PinDeletion {
    pub sender_name: String,
    pub position: Vec3,
}

impl PinDeletion {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        write_string(&mut out, &self.sender_name);
        write_vec3(&mut out, self.position);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<PinDeletion> {
        let mut reader = Cursor::new(payload);

        Ok(PinDeletion {
            sender_name: read_string(&mut reader).wrap_err("sender name")?,
            position: read_vec3(&mut reader).wrap_err("position")?,
        })
    }
}

fn write_string(out: &mut Vec<u8>, string: &str) {
    let _ = out.write_u32::<LE>(string.len() as u32);
    out.extend_from_slice(string.as_bytes());
}

fn read_string(reader: &mut impl Read) -> Result<String> {
    let len = reader.read_u32::<LE>().wrap_err("length")?;

    // Read through `take` so a corrupt length can't make us allocate a huge buffer up front.
    let mut bytes = vec![];
    reader.take(len as u64).read_to_end(&mut bytes)?;

    if bytes.len() != len as usize {
        eyre::bail!("string needs {len} bytes but only {} remain", bytes.len());
    }

    Ok(String::from_utf8(bytes)?)
}

fn write_vec3(out: &mut Vec<u8>, v: Vec3) {
    for component in [v.x, v.y, v.z] {
        let _ = out.write_f32::<LE>(component);
    }
}

fn read_vec3(reader: &mut impl Read) -> Result<Vec3> {
    Ok(Vec3::new(
        reader.read_f32::<LE>()?,
        reader.read_f32::<LE>()?,
        reader.read_f32::<LE>()?,
    ))
}

//! Shared map exploration.
//!
//! The server keeps one exploration bitmap covering the whole world map and marks the area
//! around every player as they move. A client sends everything it has explored when it spawns;
//! the server merges that in and answers with the complete map.
//!
//! Packets are a `u32` pixel count, that many `u32` pixel indices, and a final byte that is 1 on
//! the last packet of a transfer.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Cursor, Read, Write},
    path::{Path, PathBuf},
};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use eyre::{Context, Result};

use super::{queue::RpcQueue, MapSurface, PeerId, RoutedRpc, MAP_SYNC};
use crate::vector::Vec3;

/// Largest number of pixel indices sent in one packet.
const CHUNK_SIZE: usize = 10_000;

pub struct ExploreMap {
    size: u32,

    /// World units covered by one pixel.
    pixel_size: f32,

    explored: Vec<bool>,
}

impl ExploreMap {
    /// The host's minimap dimensions.
    pub const TEXTURE_SIZE: u32 = 256;
    pub const PIXEL_SIZE: f32 = 64.0;

    pub fn new(size: u32, pixel_size: f32) -> ExploreMap {
        ExploreMap {
            size,
            pixel_size,
            explored: vec![false; (size * size) as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// The pixel that `position` falls in. Only `x` and `z` matter; the result may be off the map.
    pub fn world_to_pixel(&self, position: Vec3) -> (i64, i64) {
        let half = (self.size / 2) as f32;

        (
            (position.x / self.pixel_size + half).round() as i64,
            (position.z / self.pixel_size + half).round() as i64,
        )
    }

    fn index(&self, x: i64, y: i64) -> Option<usize> {
        let size = self.size as i64;

        if (0..size).contains(&x) && (0..size).contains(&y) {
            Some((y * size + x) as usize)
        } else {
            None
        }
    }

    pub fn is_explored(&self, x: i64, y: i64) -> bool {
        self.index(x, y).map_or(false, |i| self.explored[i])
    }

    /// Marks every pixel within `radius` world units of `position`. Returns how many pixels were
    /// newly explored.
    pub fn explore(&mut self, position: Vec3, radius: f32) -> usize {
        if !position.x.is_finite() || !position.z.is_finite() || !radius.is_finite() {
            return 0;
        }

        let size = self.size as i64;

        // A disc wider than the map covers all of it.
        let r = ((radius / self.pixel_size).ceil() as i64).clamp(0, size * 2);
        let (cx, cy) = self.world_to_pixel(position);

        if cx < -r || cx > size + r || cy < -r || cy > size + r {
            return 0;
        }

        let mut marked = 0;

        for y in (cy - r).max(0)..=(cy + r).min(size - 1) {
            for x in (cx - r).max(0)..=(cx + r).min(size - 1) {
                let (dx, dy) = ((x - cx) as f32, (y - cy) as f32);

                if (dx * dx + dy * dy).sqrt() > r as f32 {
                    continue;
                }

                if let Some(i) = self.index(x, y) {
                    if !self.explored[i] {
                        self.explored[i] = true;
                        marked += 1;
                    }
                }
            }
        }

        marked
    }

    /// Marks every listed pixel. Indices outside the map are ignored. Returns how many pixels
    /// were newly explored.
    pub fn merge(&mut self, indices: &[u32]) -> usize {
        let mut marked = 0;

        for &index in indices {
            match self.explored.get_mut(index as usize) {
                Some(pixel) if !*pixel => {
                    *pixel = true;
                    marked += 1;
                }

                _ => {}
            }
        }

        marked
    }

    pub fn explored_indices(&self) -> Vec<u32> {
        self.explored
            .iter()
            .enumerate()
            .filter(|(_, explored)| **explored)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn explored_count(&self) -> usize {
        self.explored.iter().filter(|e| **e).count()
    }

    /// Writes the map as its size followed by one bit per pixel.
    fn write(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_u32::<LE>(self.size)?;

        for chunk in self.explored.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (bit, set)| byte | ((*set as u8) << bit));

            writer.write_u8(byte)?;
        }

        Ok(())
    }

    fn read(&mut self, reader: &mut impl Read) -> Result<()> {
        let size = reader.read_u32::<LE>().wrap_err("map size")?;

        if size != self.size {
            eyre::bail!("saved map is {size} pixels wide, expected {}", self.size);
        }

        let mut bytes = vec![0u8; (self.explored.len() + 7) / 8];
        reader.read_exact(&mut bytes).wrap_err("map pixels")?;

        for (i, pixel) in self.explored.iter_mut().enumerate() {
            *pixel = bytes[i / 8] & (1 << (i % 8)) != 0;
        }

        Ok(())
    }
}

/// Splits `indices` into packets.
pub fn encode_packets(indices: &[u32]) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u32]> = if indices.is_empty() {
        // An empty transfer is still one packet, so the other side learns it is complete.
        vec![indices]
    } else {
        indices.chunks(CHUNK_SIZE).collect()
    };

    let count = chunks.len();

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut packet = Vec::with_capacity(5 + chunk.len() * 4);
            let _ = packet.write_u32::<LE>(chunk.len() as u32);

            for &index in chunk {
                let _ = packet.write_u32::<LE>(index);
            }

            let _ = packet.write_u8((i + 1 == count) as u8);
            packet
        })
        .collect()
}

/// Reads one packet, returning its pixel indices and whether it ends the transfer.
pub fn decode_packet(payload: &[u8]) -> Result<(Vec<u32>, bool)> {
    let mut reader = Cursor::new(payload);
    let count = reader.read_u32::<LE>().wrap_err("pixel count")? as usize;

    if count * 4 + 5 > payload.len() {
        eyre::bail!("packet claims {count} pixels but is {} bytes", payload.len());
    }

    let mut indices = Vec::with_capacity(count);

    for _ in 0..count {
        indices.push(reader.read_u32::<LE>().wrap_err("pixel index")?);
    }

    let last = reader.read_u8().wrap_err("final packet flag")? != 0;
    Ok((indices, last))
}

/// Both ends of exploration sharing.
pub struct ExploreSync {
    map: ExploreMap,
    path: PathBuf,

    /// Whether to send our exploration when the local player next spawns.
    sync_on_spawn: bool,
}

impl ExploreSync {
    pub fn new(path: impl Into<PathBuf>, map: ExploreMap) -> ExploreSync {
        ExploreSync {
            map,
            path: path.into(),
            sync_on_spawn: true,
        }
    }

    pub fn map(&self) -> &ExploreMap {
        &self.map
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_load(&mut self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }

        let file =
            File::open(&self.path).wrap_err_with(|| format!("opening {}", self.path.display()))?;

        self.map.read(&mut BufReader::new(file))?;
        Ok(true)
    }

    /// Loads the saved map, if there is one. Errors are logged and leave the map unexplored.
    pub fn load(&mut self) {
        match self.try_load() {
            Ok(true) => log::info!(
                "Loaded exploration data ({} pixels explored).",
                self.map.explored_count()
            ),

            Ok(false) => log::info!("No exploration data saved yet."),

            Err(err) => {
                log::error!("Failed to load exploration data: {err:?}");
                self.map = ExploreMap::new(self.map.size, self.map.pixel_size);
            }
        }
    }

    fn try_save(&self) -> Result<()> {
        let temp = self.path.with_extension("tmp");

        {
            let mut writer = BufWriter::new(
                File::create(&temp).wrap_err_with(|| format!("creating {}", temp.display()))?,
            );

            self.map.write(&mut writer)?;
            writer.flush()?;
        }

        std::fs::rename(&temp, &self.path)
            .wrap_err_with(|| format!("replacing {}", self.path.display()))?;

        Ok(())
    }

    pub fn save(&self) {
        match self.try_save() {
            Ok(()) => log::info!("Saved exploration data."),
            Err(err) => log::error!("Failed to save exploration data: {err:?}"),
        }
    }

    /// Server: a peer reported its position.
    pub fn on_peer_position(&mut self, position: Vec3, radius: f32) -> usize {
        self.map.explore(position, radius)
    }

    /// Client: the local player spawned. Queues our explored pixels for the server the first
    /// time this happens after connecting.
    pub fn on_spawn(&mut self, rpc: &dyn RoutedRpc, map: &dyn MapSurface, queue: &mut RpcQueue) {
        if !self.sync_on_spawn {
            return;
        }

        self.sync_on_spawn = false;

        let explored = map.explored();
        log::info!("Sending {} explored pixels to the server.", explored.len());

        for packet in encode_packets(&explored) {
            queue.enqueue(rpc.server_id(), MAP_SYNC, packet);
        }
    }

    /// Client: we left the server.
    pub fn on_disconnect(&mut self) {
        self.sync_on_spawn = true;
    }

    /// Handles an exploration packet on either end.
    pub fn on_rpc(
        &mut self,
        rpc: &dyn RoutedRpc,
        map: &mut dyn MapSurface,
        queue: &mut RpcQueue,
        sender: PeerId,
        payload: &[u8],
    ) {
        let (indices, last) = match decode_packet(payload) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("Bad exploration packet from {sender}: {err:?}");
                return;
            }
        };

        if rpc.is_server() {
            let added = self.map.merge(&indices);
            log::debug!("Merged {added} newly explored pixels from {sender}.");

            if last {
                for packet in encode_packets(&self.map.explored_indices()) {
                    queue.enqueue(sender, MAP_SYNC, packet);
                }
            }
        } else if sender == rpc.server_id() {
            map.reveal(&indices);

            if last {
                log::info!("Received the shared map from the server.");
            }
        }
    }
}

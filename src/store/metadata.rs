//! Persistent pyramid metadata (`metadata.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Region;

/// Current on-disk cache format version.
///
/// Entries written with any other version are rebuilt from scratch.
pub const CACHE_VERSION: u32 = 1;

/// Description of one cached pyramid.
///
/// Serialized field names are camelCase and must stay stable: the cache is
/// reused across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PyramidMetadata {
    pub cache_version: u32,
    pub original_path: String,
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub total_tiles: u64,
    pub thumbnail_size: u32,
    pub medium_size: u32,
    pub created_at: DateTime<Utc>,
}

impl PyramidMetadata {
    /// Derive metadata for an image of the given dimensions.
    ///
    /// `width`, `height` and `tile_size` must be non-zero.
    pub fn new(
        original_path: impl Into<String>,
        width: u32,
        height: u32,
        tile_size: u32,
        thumbnail_size: u32,
        medium_size: u32,
    ) -> Self {
        let tiles_x = width.div_ceil(tile_size);
        let tiles_y = height.div_ceil(tile_size);
        Self {
            cache_version: CACHE_VERSION,
            original_path: original_path.into(),
            width,
            height,
            tile_size,
            tiles_x,
            tiles_y,
            total_tiles: tiles_x as u64 * tiles_y as u64,
            thumbnail_size,
            medium_size,
            created_at: Utc::now(),
        }
    }

    /// Check the fields a reader relies on to address tiles.
    ///
    /// The recorded grid must match the one derived from the image dimensions.
    pub fn check_grid(&self) -> Result<(), String> {
        for (name, value) in [
            ("width", self.width),
            ("height", self.height),
            ("tileSize", self.tile_size),
            ("thumbnailSize", self.thumbnail_size),
            ("mediumSize", self.medium_size),
        ] {
            if value == 0 {
                return Err(format!("{} is zero", name));
            }
        }

        let tiles_x = self.width.div_ceil(self.tile_size);
        let tiles_y = self.height.div_ceil(self.tile_size);
        if self.tiles_x != tiles_x || self.tiles_y != tiles_y {
            return Err(format!(
                "grid is {}x{}, expected {}x{} for {}x{} at tile size {}",
                self.tiles_x, self.tiles_y, tiles_x, tiles_y, self.width, self.height, self.tile_size
            ));
        }
        if self.total_tiles != tiles_x as u64 * tiles_y as u64 {
            return Err(format!(
                "totalTiles is {}, expected {}",
                self.total_tiles,
                tiles_x as u64 * tiles_y as u64
            ));
        }
        Ok(())
    }

    /// Whether `(x, y)` addresses a tile inside the grid.
    pub fn contains_tile(&self, x: u32, y: u32) -> bool {
        x < self.tiles_x && y < self.tiles_y
    }

    /// Source pixel window for tile `(x, y)`, clipped to the image bounds.
    ///
    /// Returns `None` for coordinates outside the grid.
    pub fn tile_region(&self, x: u32, y: u32) -> Option<Region> {
        if !self.contains_tile(x, y) {
            return None;
        }
        let left = x.checked_mul(self.tile_size)?;
        let top = y.checked_mul(self.tile_size)?;
        let width = self.tile_size.min(self.width.saturating_sub(left));
        let height = self.tile_size.min(self.height.saturating_sub(top));
        if width == 0 || height == 0 {
            return None;
        }
        Some(Region {
            x: left,
            y: top,
            width,
            height,
        })
    }

    /// Whether the source is large enough to get a medium overview at build time.
    pub fn needs_eager_medium(&self) -> bool {
        self.width.max(self.height) > self.medium_size
    }

    /// Row-major iterator over every tile coordinate in the grid.
    pub fn tile_coords(&self) -> impl Iterator<Item = (u32, u32)> {
        let tiles_x = self.tiles_x;
        (0..self.tiles_y).flat_map(move |y| (0..tiles_x).map(move |x| (x, y)))
    }
}

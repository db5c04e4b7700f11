//! Logical page to physical device mapping.
//!
//! The mapping is a pure function of `(page_index, layout)`: no state is
//! kept between calls, so any mapper built from the same layout resolves
//! every page to the same locations.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Striping policy named by `RAID_mapping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaidPolicy {
    /// Round-robin striping.
    Raid0,
    /// Striping with the starting device rotated every stripe row. No parity.
    Raid5,
    /// Every device holds every page.
    Mirror,
}

impl FromStr for RaidPolicy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RAID0" => Ok(RaidPolicy::Raid0),
            "RAID5" => Ok(RaidPolicy::Raid5),
            "MIRROR" | "RAID1" => Ok(RaidPolicy::Mirror),
            _ => Err(StorageError::config(format!("unknown RAID_mapping '{}'", s))),
        }
    }
}

impl fmt::Display for RaidPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaidPolicy::Raid0 => write!(f, "RAID0"),
            RaidPolicy::Raid5 => write!(f, "RAID5"),
            RaidPolicy::Mirror => write!(f, "MIRROR"),
        }
    }
}

/// Everything the mapping depends on. Persisted per logical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RaidLayout {
    /// Striping policy.
    pub policy: RaidPolicy,
    /// Number of devices striped across.
    pub num_devices: u16,
    /// Page size in bytes.
    pub page_size: u64,
    /// Stripe unit in pages.
    pub stripe_pages: u64,
}

/// One physical home of a logical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalLocation {
    /// Device index.
    pub device: u16,
    /// Byte offset within the file's part on that device.
    pub offset: u64,
}

/// Maps logical page indices to device locations.
#[derive(Debug, Clone)]
pub struct RaidMapper {
    layout: RaidLayout,
}

impl RaidMapper {
    /// Builds a mapper. Zero devices or a zero stripe unit is a configuration error.
    pub fn new(layout: RaidLayout) -> StorageResult<Self> {
        if layout.num_devices == 0 {
            return Err(StorageError::config("RAID mapper needs at least one device"));
        }
        if layout.page_size == 0 || layout.stripe_pages == 0 {
            return Err(StorageError::config(
                "RAID mapper needs a non-zero page size and stripe unit",
            ));
        }
        Ok(Self { layout })
    }

    /// The layout this mapper resolves.
    pub fn layout(&self) -> &RaidLayout {
        &self.layout
    }

    /// Stripe unit in bytes.
    #[inline]
    pub fn stripe_unit(&self) -> u64 {
        self.layout.stripe_pages * self.layout.page_size
    }

    /// Resolves a page to every location holding it.
    ///
    /// Striped policies return exactly one location; mirrored pages return
    /// one per device, primary first.
    pub fn map(&self, page_index: u64) -> Vec<PhysicalLocation> {
        match self.layout.policy {
            RaidPolicy::Raid0 | RaidPolicy::Raid5 => vec![self.primary(page_index)],
            RaidPolicy::Mirror => {
                let offset = page_index * self.layout.page_size;
                (0..self.layout.num_devices)
                    .map(|device| PhysicalLocation { device, offset })
                    .collect()
            }
        }
    }

    /// Resolves a page to its first location.
    pub fn primary(&self, page_index: u64) -> PhysicalLocation {
        let d = self.layout.num_devices as u64;
        let page_size = self.layout.page_size;
        match self.layout.policy {
            RaidPolicy::Mirror => PhysicalLocation {
                device: 0,
                offset: page_index * page_size,
            },
            RaidPolicy::Raid0 | RaidPolicy::Raid5 => {
                let stripe_pages = self.layout.stripe_pages;
                // Stripe unit index: page_index * page_size / U.
                let stripe = page_index / stripe_pages;
                let within = page_index % stripe_pages;
                let row = stripe / d;
                let device = match self.layout.policy {
                    RaidPolicy::Raid5 => (stripe + row) % d,
                    _ => stripe % d,
                };
                PhysicalLocation {
                    device: device as u16,
                    offset: row * self.stripe_unit() + within * page_size,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(policy: RaidPolicy, num_devices: u16, stripe_pages: u64) -> RaidLayout {
        RaidLayout {
            policy,
            num_devices,
            page_size: 4096,
            stripe_pages,
        }
    }

    #[test]
    fn test_zero_devices_rejected() {
        let err = RaidMapper::new(layout(RaidPolicy::Raid0, 0, 1)).unwrap_err();
        assert!(matches!(err, StorageError::Configuration { .. }));
        assert!(RaidMapper::new(layout(RaidPolicy::Raid0, 2, 0)).is_err());
    }

    #[test]
    fn test_raid0_single_page_stripes() {
        let mapper = RaidMapper::new(layout(RaidPolicy::Raid0, 4, 1)).unwrap();
        let locs: Vec<_> = (0..8).map(|p| mapper.primary(p)).collect();
        let devices: Vec<u16> = locs.iter().map(|l| l.device).collect();
        assert_eq!(devices, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(locs[0].offset, 0);
        assert_eq!(locs[3].offset, 0);
        assert_eq!(locs[4].offset, 4096);
        assert_eq!(locs[7].offset, 4096);
    }

    #[test]
    fn test_raid0_multi_page_stripe_unit() {
        // 2 devices, 4-page stripe unit: pages 0-3 on dev 0, 4-7 on dev 1, 8-11 on dev 0.
        let mapper = RaidMapper::new(layout(RaidPolicy::Raid0, 2, 4)).unwrap();
        assert_eq!(mapper.primary(3), PhysicalLocation { device: 0, offset: 3 * 4096 });
        assert_eq!(mapper.primary(4), PhysicalLocation { device: 1, offset: 0 });
        assert_eq!(mapper.primary(9), PhysicalLocation { device: 0, offset: 5 * 4096 });
        assert_eq!(mapper.stripe_unit(), 16384);
    }

    #[test]
    fn test_raid5_rotates_start_device() {
        let mapper = RaidMapper::new(layout(RaidPolicy::Raid5, 3, 1)).unwrap();
        let devices: Vec<u16> = (0..9).map(|p| mapper.primary(p).device).collect();
        assert_eq!(devices, vec![0, 1, 2, 1, 2, 0, 2, 0, 1]);
        assert_eq!(mapper.primary(4).offset, 4096);
    }

    #[test]
    fn test_mirror_is_one_to_many() {
        let mapper = RaidMapper::new(layout(RaidPolicy::Mirror, 3, 1)).unwrap();
        let locs = mapper.map(5);
        assert_eq!(locs.len(), 3);
        assert!(locs.iter().all(|l| l.offset == 5 * 4096));
        assert_eq!(locs.iter().map(|l| l.device).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(mapper.primary(5), locs[0]);
    }

    #[test]
    fn test_striped_map_returns_primary() {
        let mapper = RaidMapper::new(layout(RaidPolicy::Raid0, 5, 2)).unwrap();
        for p in 0..50 {
            assert_eq!(mapper.map(p), vec![mapper.primary(p)]);
        }
    }

    #[test]
    fn test_policy_parse_and_display() {
        assert_eq!("RAID0".parse::<RaidPolicy>().unwrap(), RaidPolicy::Raid0);
        assert_eq!("raid5".parse::<RaidPolicy>().unwrap(), RaidPolicy::Raid5);
        assert_eq!("RAID1".parse::<RaidPolicy>().unwrap(), RaidPolicy::Mirror);
        assert!("HASH".parse::<RaidPolicy>().is_err());
        assert_eq!(RaidPolicy::Mirror.to_string(), "MIRROR");
    }
}

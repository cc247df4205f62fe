use serde::{Deserialize, Serialize};

/// Coherence engine configuration.
///
/// Geometry covers two arrays: the directory array tracks every line the
/// engine knows about, the (smaller) data array holds the subset that is
/// locally cached. Non-inclusive, so `data_sets * data_assoc` may be much
/// smaller than `dir_sets * dir_assoc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Name of this cache; used as `src` on every emitted message.
    pub owner_name: String,
    /// Name of the next level below (toward memory).
    pub parent_name: String,

    /// Cache line size in bytes. Must be a power of two.
    pub line_size: u32,

    pub dir_sets: usize,
    pub dir_assoc: usize,
    pub data_sets: usize,
    pub data_assoc: usize,

    /// Maximum number of events queued across all MSHR registers.
    pub mshr_entries: usize,

    /// Promote IS to E on a clean exclusive response (MESI); plain MSI otherwise.
    pub protocol_mes: bool,
    /// No coherence level below this one; S upgrades to M in place on a write.
    pub last_level: bool,
    /// Whether Put* writebacks are acknowledged with AckPut.
    pub expect_writeback_ack: bool,
    /// Whether PutS/PutE carry data.
    pub writeback_clean_blocks: bool,

    pub tag_latency: u64,
    pub access_latency: u64,
    pub mshr_latency: u64,
    pub packet_header_bytes: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner_name: "l2".to_string(),
            parent_name: "l3".to_string(),
            line_size: 64,
            dir_sets: 256,
            dir_assoc: 8,
            data_sets: 64,
            data_assoc: 8,
            mshr_entries: 32,
            protocol_mes: true,
            last_level: false,
            expect_writeback_ack: false,
            writeback_clean_blocks: false,
            tag_latency: 2,
            access_latency: 9,
            mshr_latency: 1,
            packet_header_bytes: 8,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("line size {0} is not a power of two")]
    LineSize(u32),
    #[error("{name} must be non-zero")]
    ZeroGeometry { name: &'static str },
    #[error("data array ({data} lines) larger than directory array ({dir} lines)")]
    DataLargerThanDirectory { data: usize, dir: usize },
    #[error("mshr_entries must be non-zero")]
    ZeroMshr,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.line_size.is_power_of_two() {
            return Err(ConfigError::LineSize(self.line_size));
        }
        for (name, value) in [
            ("dir_sets", self.dir_sets),
            ("dir_assoc", self.dir_assoc),
            ("data_sets", self.data_sets),
            ("data_assoc", self.data_assoc),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroGeometry { name });
            }
        }
        let dir = self.dir_sets * self.dir_assoc;
        let data = self.data_sets * self.data_assoc;
        if data > dir {
            return Err(ConfigError::DataLargerThanDirectory { data, dir });
        }
        if self.mshr_entries == 0 {
            return Err(ConfigError::ZeroMshr);
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn block_addr(&self, addr: crate::address) -> crate::address {
        addr & !u64::from(self.line_size - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError};

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_non_power_of_two_line_size() {
        let config = Config {
            line_size: 48,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::LineSize(48)));
    }

    #[test]
    fn rejects_data_array_larger_than_directory() {
        let config = Config {
            dir_sets: 4,
            dir_assoc: 2,
            data_sets: 16,
            data_assoc: 8,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DataLargerThanDirectory { .. })
        ));
    }

    #[test]
    fn block_addr_masks_offset_bits() {
        let config = Config::default();
        assert_eq!(config.block_addr(0x1234), 0x1200);
        assert_eq!(config.block_addr(0x40), 0x40);
    }
}

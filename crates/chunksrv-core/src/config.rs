use serde::Deserialize;

/// Runtime configuration for the chunk-server data plane. Field defaults
/// mirror the literal constants `masterconn.c`/`readdata.c` compile in;
/// everything here is overridable via `--config path.toml` plus CLI flags
/// in the binaries, the way `rshogi-csa-server-tcp` layers config file
/// under CLI overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkServerConfig {
    pub master_host: String,
    pub master_port: String,
    /// Registration/heartbeat timeout in seconds, clamped to `[2, 65535]`
    /// the way `masterconn_init` clamps `Timeout`. Kept as `u32` (wider
    /// than the wire field) so out-of-range config values still have
    /// something to clamp from, matching the original's `int Timeout`.
    pub master_timeout: u32,
    pub master_reconnection_delay: u32,
    /// Changelog backup count (`BACK_LOGS` in the original): how many
    /// `changelog_csback.<N>.mfs` files `StructureLogRotate` keeps.
    pub back_logs: u32,
    pub job_pool_workers: usize,
    /// Bounded job pool work queue capacity (`jobs` in `job_pool_new`,
    /// 10000 for the chunkserver's own BJP instance).
    pub job_queue_capacity: usize,

    /// Read-session retry ceiling (`RETRIES` in `readdata.c`).
    pub retries: u32,
    /// Microseconds between forced chunkserver-connection refreshes
    /// (`REFRESHTIMEOUT`).
    pub refresh_timeout_us: u64,
    /// Microseconds of read-session idle time before the reaper closes
    /// the chunkserver TCP connection (`READDELAY`).
    pub read_delay_us: u64,

    /// This chunkserver's own address as advertised to the master in the
    /// registration packet (`mylocaddr`/`mycfg*` in `masterconn_init`).
    pub bind_ip: u32,
    pub bind_port: u16,
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        Self {
            master_host: "mfsmaster".to_string(),
            master_port: "9420".to_string(),
            master_timeout: 60,
            master_reconnection_delay: 5,
            back_logs: 50,
            job_pool_workers: 4,
            job_queue_capacity: 10_000,
            retries: 30,
            refresh_timeout_us: 5_000_000,
            read_delay_us: 1_000_000,
            bind_ip: 0,
            bind_port: 9422,
        }
    }
}

impl ChunkServerConfig {
    /// Applies the same clamp `masterconn_init` applies to the configured
    /// `Timeout` value before using it as a heartbeat interval.
    pub fn clamped_master_timeout(&self) -> u16 {
        if self.master_timeout > 65535 {
            65535
        } else if self.master_timeout <= 1 {
            2
        } else {
            self.master_timeout as u16
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        let cfg = ChunkServerConfig::default();
        assert_eq!(cfg.master_host, "mfsmaster");
        assert_eq!(cfg.master_port, "9420");
        assert_eq!(cfg.master_timeout, 60);
        assert_eq!(cfg.master_reconnection_delay, 5);
        assert_eq!(cfg.back_logs, 50);
        assert_eq!(cfg.retries, 30);
    }

    #[test]
    fn timeout_clamp_matches_masterconn_init() {
        let mut cfg = ChunkServerConfig::default();
        cfg.master_timeout = 0;
        assert_eq!(cfg.clamped_master_timeout(), 2);
        cfg.master_timeout = 1;
        assert_eq!(cfg.clamped_master_timeout(), 2);
        cfg.master_timeout = 120;
        assert_eq!(cfg.clamped_master_timeout(), 120);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: ChunkServerConfig =
            ChunkServerConfig::from_toml_str("master_host = \"meta1\"\nback_logs = 100\n").unwrap();
        assert_eq!(cfg.master_host, "meta1");
        assert_eq!(cfg.back_logs, 100);
        assert_eq!(cfg.master_port, "9420");
    }
}

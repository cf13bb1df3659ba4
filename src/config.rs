use std::time::Duration;

/// How to launch the calculation engine process for a document.
///
/// The engine is started once per open document and receives the document id
/// as its final argument.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executable to run (e.g., "python3")
    pub command: String,
    /// Arguments passed before the document id
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["-u".to_string(), "-m".to_string(), "sandbox".to_string()],
        }
    }
}

/// Periodic push of wall-clock time into each open document's engine.
///
/// Each tick waits `delay_ms` plus a random amount up to `variance_ms`, so
/// documents opened together do not all update at once.
#[derive(Debug, Clone)]
pub struct TimeUpdateConfig {
    pub enabled: bool,
    pub delay_ms: u64,
    pub variance_ms: u64,
}

impl Default for TimeUpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 60_000,
            variance_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocHostConfig {
    /// Idle time with no sessions and no calls before a document shuts down
    pub inactivity_timeout_ms: u64,
    /// How long shutdown waits for in-flight mutating calls to finish
    pub grace_period_ms: u64,
    /// Upper bound on each shutdown step before it is treated as hung
    pub shutdown_item_timeout_ms: u64,
    /// Delay between giving up on a hung engine and killing its process
    pub kill_delay_ms: u64,
    /// Upper bound on starting the engine for a newly opened document
    pub load_timeout_ms: u64,
    pub time_update: TimeUpdateConfig,
    pub engine: EngineConfig,
}

impl Default for DocHostConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 30_000,
            grace_period_ms: 10_000,
            shutdown_item_timeout_ms: 5_000,
            kill_delay_ms: 1_000,
            load_timeout_ms: 30_000,
            time_update: TimeUpdateConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl DocHostConfig {
    /// Short timeouts suitable for test harnesses.
    pub fn for_tests() -> Self {
        Self {
            inactivity_timeout_ms: 100,
            grace_period_ms: 100,
            shutdown_item_timeout_ms: 200,
            kill_delay_ms: 50,
            load_timeout_ms: 1_000,
            time_update: TimeUpdateConfig {
                enabled: true,
                delay_ms: 50,
                variance_ms: 10,
            },
            engine: EngineConfig::default(),
        }
    }

    pub fn with_engine(mut self, command: String, args: Vec<String>) -> Self {
        self.engine = EngineConfig { command, args };
        self
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn shutdown_item_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_item_timeout_ms)
    }

    pub fn kill_delay(&self) -> Duration {
        Duration::from_millis(self.kill_delay_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Worst-case time from the start of a shutdown to `Closed`.
    pub fn max_shutdown_time(&self, forced: bool) -> Duration {
        let grace = if forced {
            Duration::ZERO
        } else {
            self.grace_period()
        };
        grace + self.shutdown_item_timeout() + self.kill_delay()
    }
}

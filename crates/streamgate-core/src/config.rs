use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Which deployment profile the gateway runs under. `Production` raises the peer-connection
/// ceiling and moves the temp root under a container-friendly path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Development,
    Production,
}

impl Profile {
    pub fn from_env() -> Self {
        match std::env::var("APP_ENV").as_deref() {
            Ok("production") => Profile::Production,
            _ => Profile::Development,
        }
    }

    pub fn peer_connection_limit(self) -> usize {
        match self {
            Profile::Development => 100,
            Profile::Production => 200,
        }
    }
}

/// Process-wide configuration, constructed once at startup and shared as `Arc<Config>` by
/// every component. Layering is: compiled-in defaults, then environment variables, then
/// whatever the binary's CLI flags override explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: SocketAddr,
    pub temp_root: PathBuf,
    pub profile: Profile,
    pub max_concurrent_streams: usize,
    pub readiness_timeout: Duration,
    pub watchdog_tick: Duration,
    pub janitor_interval: Duration,
    pub janitor_max_age: Duration,
    pub ffmpeg_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let profile = Profile::from_env();
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000),
            temp_root: default_temp_root(profile),
            profile,
            max_concurrent_streams: 4,
            readiness_timeout: Duration::from_secs(60),
            watchdog_tick: Duration::from_secs(10),
            janitor_interval: Duration::from_secs(600),
            janitor_max_age: Duration::from_secs(1800),
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

fn default_temp_root(profile: Profile) -> PathBuf {
    match profile {
        Profile::Production => PathBuf::from("/app/temp"),
        Profile::Development => PathBuf::from("./temp"),
    }
}

impl Config {
    /// Applies the environment-variable layer documented in the configuration model
    /// (`PORT`, `APP_ENV`, `TEMP_ROOT`, `MAX_CONCURRENT_STREAMS`, `FFMPEG_PATH`) on top of
    /// the compiled-in defaults. CLI flags are applied afterwards by the binary crate.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                cfg.http_addr.set_port(port);
            }
        }
        if let Ok(root) = std::env::var("TEMP_ROOT") {
            cfg.temp_root = PathBuf::from(root);
        }
        if let Ok(n) = std::env::var("MAX_CONCURRENT_STREAMS") {
            if let Ok(n) = n.parse::<usize>() {
                cfg.max_concurrent_streams = n;
            }
        }
        if let Ok(path) = std::env::var("FFMPEG_PATH") {
            cfg.ffmpeg_path = PathBuf::from(path);
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_development() {
        // SAFETY: test runs single-threaded w.r.t. this var; no other test touches APP_ENV.
        unsafe { std::env::remove_var("APP_ENV") };
        assert_eq!(Profile::from_env(), Profile::Development);
        assert_eq!(Profile::Development.peer_connection_limit(), 100);
        assert_eq!(Profile::Production.peer_connection_limit(), 200);
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = Config {
            profile: Profile::Development,
            ..Config::default()
        };
        assert_eq!(cfg.http_addr.port(), 3000);
        assert_eq!(cfg.max_concurrent_streams, 4);
        assert_eq!(cfg.readiness_timeout, Duration::from_secs(60));
        assert_eq!(cfg.watchdog_tick, Duration::from_secs(10));
        assert_eq!(cfg.janitor_interval, Duration::from_secs(600));
        assert_eq!(cfg.janitor_max_age, Duration::from_secs(1800));
    }
}

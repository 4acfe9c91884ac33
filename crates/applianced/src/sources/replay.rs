use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use linkme::distributed_slice;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::PushSource;
use super::REGISTRY;
use super::SourceContext;
use super::SourceFactoryResult;
use super::SourceHandle;
use super::decode_envelope;
use super::forward;
use crate::config::ReplaySourceConfig;
use crate::coordinator::Bridge;
use crate::coordinator::UpdateCoordinator;

#[distributed_slice(REGISTRY)]
fn init_replay(ctx: &SourceContext) -> SourceFactoryResult {
    let Some(config) = &ctx.config.sources.replay else {
        return Ok(None);
    };
    Ok(Some(Box::new(ReplaySource::new(config))))
}

/// Replays a JSON-lines recording of updates, one envelope per line.
pub struct ReplaySource {
    path: PathBuf,
    interval: Duration,
}

impl ReplaySource {
    pub fn new(config: &ReplaySourceConfig) -> Self {
        Self {
            path: config.path.clone(),
            interval: Duration::from_millis(config.interval_ms),
        }
    }
}

impl PushSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    fn start(self: Box<Self>, bridge: Bridge<UpdateCoordinator>) -> anyhow::Result<SourceHandle> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open replay file {}", self.path.display()))?;
        info!("Replaying updates from {}", self.path.display());

        let interval = self.interval;
        let handle = SourceHandle::spawn("replay", move |stop| {
            let sent = replay(BufReader::new(file), &bridge, interval, &stop);
            info!("Replay finished after {} update(s)", sent);
        })
        .context("Failed to spawn replay thread")?;
        Ok(handle)
    }
}

/// Submit every decodable line. Stops at end of input, on the stop flag, or
/// once the coordinator is gone. Returns the number of updates submitted.
fn replay(
    reader: impl BufRead,
    bridge: &Bridge<UpdateCoordinator>,
    interval: Duration,
    stop: &AtomicBool,
) -> usize {
    let mut sent = 0;
    for (index, line) in reader.lines().enumerate() {
        if stop.load(Ordering::SeqCst) {
            debug!("Replay stopped at line {}", index + 1);
            break;
        }

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Replay read failed at line {}: {}", index + 1, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match decode_envelope(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping replay line {}: {}", index + 1, e);
                continue;
            }
        };
        if !forward("replay", bridge, message) {
            break;
        }
        sent += 1;

        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::io::Write;
    use std::sync::Arc;

    use super::*;
    use crate::coordinator::AttributeValue;
    use crate::coordinator::Lifecycle;
    use crate::coordinator::channel;
    use crate::host::StateStore;

    const RECORDING: &str = r#"{"applianceId": "wm-1", "fields": {"connectionStatus": "connected", "temp": 20}}

not json
{"applianceId": "wm-1", "fields": {"temp": 30}}
"#;

    fn drain(rx: &mut crate::coordinator::BridgeReceiver<UpdateCoordinator>) -> UpdateCoordinator {
        let mut coordinator = UpdateCoordinator::new("test", Arc::new(StateStore::new()));
        while let Some(job) = rx.try_recv() {
            job(&mut coordinator);
        }
        coordinator
    }

    #[test]
    fn test_replay_skips_bad_lines() {
        let (bridge, mut rx) = channel::<UpdateCoordinator>(8);
        let stop = AtomicBool::new(false);

        let sent = replay(Cursor::new(RECORDING), &bridge, Duration::ZERO, &stop);
        assert_eq!(sent, 2);

        let coordinator = drain(&mut rx);
        assert_eq!(coordinator.lifecycle("wm-1"), Some(Lifecycle::Active));
        assert_eq!(
            coordinator.snapshot("wm-1").unwrap().attribute("temp"),
            Some(&AttributeValue::Int(30))
        );
    }

    #[test]
    fn test_replay_honours_stop() {
        let (bridge, mut rx) = channel::<UpdateCoordinator>(8);
        let stop = AtomicBool::new(true);

        assert_eq!(replay(Cursor::new(RECORDING), &bridge, Duration::ZERO, &stop), 0);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_replay_stops_when_bridge_closed() {
        let (bridge, mut rx) = channel::<UpdateCoordinator>(8);
        rx.close();
        let stop = AtomicBool::new(false);

        assert_eq!(replay(Cursor::new(RECORDING), &bridge, Duration::ZERO, &stop), 0);
    }

    #[test]
    fn test_source_replays_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RECORDING.as_bytes()).unwrap();

        let (bridge, mut rx) = channel::<UpdateCoordinator>(8);
        let source = Box::new(ReplaySource::new(&ReplaySourceConfig {
            path: file.path().to_path_buf(),
            interval_ms: 0,
        }));
        let handle = source.start(bridge).unwrap();
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        let coordinator = drain(&mut rx);
        assert!(coordinator.snapshot("wm-1").is_some());
    }

    #[test]
    fn test_missing_file_fails_to_start() {
        let (bridge, _rx) = channel::<UpdateCoordinator>(8);
        let source = Box::new(ReplaySource::new(&ReplaySourceConfig {
            path: PathBuf::from("/nonexistent/updates.jsonl"),
            interval_ms: 0,
        }));
        let err = source.start(bridge).err().unwrap();
        assert!(err.to_string().contains("Failed to open replay file"));
    }
}

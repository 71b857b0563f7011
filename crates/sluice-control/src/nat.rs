//! NAT type probe
//!
//! Runs the `NTT.exe` helper against a STUN server through the active
//! session and collects its verdict.

use crate::context::ControlContext;
use crate::error::ControlError;
use crate::process::ProcessHandle;
use tokio::sync::Mutex;
use tracing::{info, warn};

const NAME: &str = "NTT";
const EXECUTABLE: &str = "NTT.exe";
const DEFAULT_STUN_PORT: u16 = 3478;

/// What the helper reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatReport {
    /// NAT type verdict
    pub result: String,
    pub local_end: Option<String>,
    pub public_end: Option<String>,
}

impl NatReport {
    fn absorb(&mut self, line: &str) {
        let Some((key, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim().to_string();

        match key.trim() {
            "Result" => self.result = value,
            "LocalEnd" => self.local_end = Some(value),
            "PublicEnd" => self.public_end = Some(value),
            _ => {}
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.result.is_empty() && self.public_end.is_some()
    }
}

/// `host port` arguments for a STUN server setting
fn stun_args(server: &str) -> String {
    match server.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => format!("{host} {port}"),
        _ => format!("{server} {DEFAULT_STUN_PORT}"),
    }
}

/// Runs the NAT helper on demand
#[derive(Debug)]
pub struct NatTester {
    ctx: ControlContext,
    process: Mutex<Option<ProcessHandle>>,
}

impl NatTester {
    pub fn new(ctx: ControlContext) -> Self {
        Self {
            ctx,
            process: Mutex::new(None),
        }
    }

    /// Probe the NAT type, bounded by the readiness poll budget
    pub async fn run(&self) -> Result<NatReport, ControlError> {
        self.stop().await;

        let mut handle = ProcessHandle::spawn(
            NAME,
            &self.ctx.bin_path(EXECUTABLE),
            &stun_args(&self.ctx.settings.stun_server),
            &self.ctx.events,
        )?;
        let mut lines = handle
            .take_lines()
            .ok_or_else(|| ControlError::backend_failed(NAME, "output unavailable"))?;
        *self.process.lock().await = Some(handle);

        let mut report = NatReport::default();
        let budget = self.ctx.poll_policy().budget();
        let collect = async {
            while let Some(line) = lines.recv().await {
                report.absorb(&line);
                if report.is_complete() {
                    break;
                }
            }
        };
        if tokio::time::timeout(budget, collect).await.is_err() {
            warn!("NAT test did not finish within {:?}", budget);
        }

        self.stop().await;

        if report.result.is_empty() {
            return Err(ControlError::backend_failed(NAME, "no result reported"));
        }
        info!("NAT type: {}", report.result);
        Ok(report)
    }

    /// Kill a running helper
    pub async fn stop(&self) {
        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            process.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.process.lock().await.is_some()
    }
}

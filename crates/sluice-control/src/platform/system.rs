//! Command-line backed platform
//!
//! Windows is driven through `sc.exe`, `netsh`, `ipconfig` and PowerShell.
//! Other systems have no redirection driver; service, driver, DNS and
//! firewall operations report `Unsupported` there.

use super::{
    DnsConfigurator, DriverRegistry, Firewall, HostInfo, NetworkProbe, ReservedPorts,
    ServiceControl, ServiceStatus,
};
use crate::port::Transport;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// `sc.exe` error: the service does not exist
const SC_SERVICE_DOES_NOT_EXIST: &str = "1060";
/// `sc.exe` error: the service is already running
const SC_ALREADY_RUNNING: &str = "1056";
/// `sc.exe` error: the service has not been started
const SC_NOT_STARTED: &str = "1062";
/// `sc.exe` error: the service already exists
const SC_ALREADY_EXISTS: &str = "1073";

/// How often `stop_and_wait` re-queries the service
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Platform implementation backed by stock OS tools
#[derive(Debug, Default)]
pub struct SystemPlatform {
    _private: (),
}

impl SystemPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Output of a finished command
struct Captured {
    success: bool,
    text: String,
}

fn capture(program: &str, args: &[&str]) -> io::Result<Captured> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output()?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(Captured {
        success: output.status.success(),
        text,
    })
}

fn run(program: &str, args: &[&str]) -> io::Result<String> {
    let captured = capture(program, args)?;
    if captured.success {
        Ok(captured.text)
    } else {
        Err(io::Error::other(format!(
            "{program} failed: {}",
            captured.text.trim()
        )))
    }
}

fn powershell(script: &str) -> io::Result<String> {
    run("powershell", &["-NoProfile", "-NonInteractive", "-Command", script])
}

fn unsupported(operation: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{operation} is only available on Windows"),
    )
}

/// Parse the `STATE` line of `sc query`
pub(crate) fn parse_sc_state(output: &str) -> ServiceStatus {
    if output.contains(SC_SERVICE_DOES_NOT_EXIST) {
        return ServiceStatus::Missing;
    }

    let state = output
        .lines()
        .find(|line| line.trim_start().starts_with("STATE"))
        .and_then(|line| line.split(':').nth(1))
        .map(|value| value.split_whitespace().collect::<Vec<_>>());

    match state.as_deref() {
        Some([_, "RUNNING", ..]) => ServiceStatus::Running,
        Some([_, "STOPPED", ..]) => ServiceStatus::Stopped,
        Some([_, "START_PENDING", ..]) => ServiceStatus::StartPending,
        Some([_, "STOP_PENDING", ..]) => ServiceStatus::StopPending,
        _ => ServiceStatus::Other,
    }
}

/// Parse `(major, minor)` out of `ver` output
/// (`Microsoft Windows [Version 10.0.19045.3803]`)
pub(crate) fn parse_os_version(output: &str) -> Option<(u32, u32)> {
    let start = output.find("Version ")? + "Version ".len();
    let mut parts = output[start..]
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .split(|c: char| c == '.' || c == ']');

    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

/// Parse `netsh int ipv4 show excludedportrange` output
///
/// Data rows are `<start> <end>` with an optional trailing `*` for
/// administered exclusions; headers and separators are skipped.
pub(crate) fn parse_excluded_ranges(output: &str) -> Vec<RangeInclusive<u16>> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let start = fields.next()?.parse::<u16>().ok()?;
            let end = fields.next()?.parse::<u16>().ok()?;
            (start <= end).then_some(start..=end)
        })
        .collect()
}

impl ServiceControl for SystemPlatform {
    fn status(&self, service: &str) -> io::Result<ServiceStatus> {
        if !cfg!(windows) {
            return Err(unsupported("service control"));
        }
        let captured = capture("sc", &["query", service])?;
        Ok(parse_sc_state(&captured.text))
    }

    fn stop_and_wait(&self, service: &str, timeout: Duration) -> io::Result<()> {
        if !cfg!(windows) {
            return Err(unsupported("service control"));
        }

        let captured = capture("sc", &["stop", service])?;
        if !captured.success && !captured.text.contains(SC_NOT_STARTED) {
            return Err(io::Error::other(format!(
                "failed to stop {service}: {}",
                captured.text.trim()
            )));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.status(service)? {
                ServiceStatus::Stopped | ServiceStatus::Missing => return Ok(()),
                _ if Instant::now() >= deadline => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{service} did not stop within {timeout:?}"),
                    ));
                }
                _ => thread::sleep(STATUS_POLL_INTERVAL),
            }
        }
    }

    fn start(&self, service: &str) -> io::Result<()> {
        if !cfg!(windows) {
            return Err(unsupported("service control"));
        }

        let captured = capture("sc", &["start", service])?;
        if captured.success || captured.text.contains(SC_ALREADY_RUNNING) {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "failed to start {service}: {}",
                captured.text.trim()
            )))
        }
    }
}

impl DriverRegistry for SystemPlatform {
    fn register(&self, service: &str, driver_path: &Path) -> io::Result<()> {
        if !cfg!(windows) {
            return Err(unsupported("driver registration"));
        }

        let bin_path = driver_path.to_string_lossy();
        let captured = capture(
            "sc",
            &[
                "create", service, "type=", "kernel", "start=", "demand", "binPath=", &bin_path,
            ],
        )?;

        if captured.success || captured.text.contains(SC_ALREADY_EXISTS) {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "failed to register {service}: {}",
                captured.text.trim()
            )))
        }
    }

    fn unregister(&self, service: &str) -> io::Result<()> {
        if !cfg!(windows) {
            return Err(unsupported("driver registration"));
        }

        let captured = capture("sc", &["delete", service])?;
        if captured.success || captured.text.contains(SC_SERVICE_DOES_NOT_EXIST) {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "failed to unregister {service}: {}",
                captured.text.trim()
            )))
        }
    }
}

impl HostInfo for SystemPlatform {
    fn os_version(&self) -> Option<(u32, u32)> {
        if !cfg!(windows) {
            return None;
        }
        run("cmd", &["/c", "ver"])
            .ok()
            .and_then(|output| parse_os_version(&output))
    }

    fn file_version(&self, path: &Path) -> Option<String> {
        if !path.exists() || !cfg!(windows) {
            return None;
        }

        let literal = path.to_string_lossy().replace('\'', "''");
        let script = format!("(Get-Item -LiteralPath '{literal}').VersionInfo.FileVersion");
        match powershell(&script) {
            Ok(output) => Some(output.trim().to_string()).filter(|v| !v.is_empty()),
            Err(e) => {
                warn!("Failed to read version of {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Interface index of the adapter carrying the default route
fn active_interface_index() -> io::Result<u32> {
    let output = powershell(
        "Get-NetRoute -DestinationPrefix '0.0.0.0/0' | Sort-Object RouteMetric | \
         Select-Object -First 1 -ExpandProperty InterfaceIndex",
    )?;

    output
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "no active network adapter"))
}

impl DnsConfigurator for SystemPlatform {
    fn current_servers(&self) -> io::Result<Vec<String>> {
        if !cfg!(windows) {
            return Err(unsupported("DNS configuration"));
        }

        let index = active_interface_index()?;
        let output = powershell(&format!(
            "Get-DnsClientServerAddress -InterfaceIndex {index} -AddressFamily IPv4 | \
             Select-Object -ExpandProperty ServerAddresses"
        ))?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn set_servers(&self, servers: &[String]) -> io::Result<()> {
        if !cfg!(windows) {
            return Err(unsupported("DNS configuration"));
        }

        let index = active_interface_index()?;
        let script = if servers.is_empty() {
            format!("Set-DnsClientServerAddress -InterfaceIndex {index} -ResetServerAddresses")
        } else {
            let list = servers
                .iter()
                .map(|server| format!("'{}'", server.replace('\'', "")))
                .collect::<Vec<_>>()
                .join(",");
            format!("Set-DnsClientServerAddress -InterfaceIndex {index} -ServerAddresses ({list})")
        };

        powershell(&script).map(|_| ())
    }
}

impl Firewall for SystemPlatform {
    fn allow_programs(&self, rule_name: &str, programs: &[PathBuf]) -> io::Result<()> {
        if !cfg!(windows) {
            return Err(unsupported("firewall rules"));
        }

        let name = format!("name={rule_name}");
        // Stale rules may point at an old install location.
        let _ = capture("netsh", &["advfirewall", "firewall", "delete", "rule", &name]);

        for program in programs.iter().filter(|p| p.exists()) {
            let program = format!("program={}", program.display());
            run(
                "netsh",
                &[
                    "advfirewall", "firewall", "add", "rule", &name, "dir=in", "action=allow",
                    &program, "enable=yes",
                ],
            )?;
        }

        info!("Firewall rules added for {} programs", programs.len());
        Ok(())
    }
}

impl NetworkProbe for SystemPlatform {
    fn flush_resolver_cache(&self) -> io::Result<()> {
        if !cfg!(windows) {
            debug!("No system resolver cache to flush");
            return Ok(());
        }
        run("ipconfig", &["/flushdns"]).map(|_| ())
    }

    fn route_to(&self, target: SocketAddr) -> io::Result<SocketAddr> {
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        // Connecting a UDP socket only selects a route; nothing is sent.
        let socket = UdpSocket::bind(bind)?;
        socket.connect(target)?;
        socket.local_addr()
    }
}

impl ReservedPorts for SystemPlatform {
    fn reserved_ranges(&self, transport: Transport) -> io::Result<Vec<RangeInclusive<u16>>> {
        if !cfg!(windows) {
            return Ok(Vec::new());
        }

        let protocol = match transport {
            Transport::Tcp => "protocol=tcp",
            Transport::Udp => "protocol=udp",
        };
        let output = run(
            "netsh",
            &["interface", "ipv4", "show", "excludedportrange", protocol],
        )?;
        Ok(parse_excluded_ranges(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sc_state() {
        let running = "SERVICE_NAME: netfilter2\n        TYPE               : 1  KERNEL_DRIVER\n        STATE              : 4  RUNNING\n";
        assert_eq!(parse_sc_state(running), ServiceStatus::Running);

        let stopped = "        STATE              : 1  STOPPED \n";
        assert_eq!(parse_sc_state(stopped), ServiceStatus::Stopped);

        let missing = "[SC] EnumQueryServicesStatus:OpenService FAILED 1060:\n";
        assert_eq!(parse_sc_state(missing), ServiceStatus::Missing);

        assert_eq!(parse_sc_state("garbage"), ServiceStatus::Other);
    }

    #[test]
    fn test_parse_os_version() {
        assert_eq!(
            parse_os_version("\r\nMicrosoft Windows [Version 10.0.19045.3803]\r\n"),
            Some((10, 0))
        );
        assert_eq!(
            parse_os_version("Microsoft Windows [Version 6.1.7601]"),
            Some((6, 1))
        );
        assert_eq!(parse_os_version("Linux"), None);
    }

    #[test]
    fn test_parse_excluded_ranges() {
        let output = "\nProtocol tcp Port Exclusion Ranges\n\n\
                      Start Port    End Port\n\
                      ----------    --------\n\
                      \x20     2869        2869\n\
                      \x20    50000       50059     *\n\n\
                      * - Administered port exclusions.\n";

        assert_eq!(parse_excluded_ranges(output), vec![2869..=2869, 50000..=50059]);
    }

    #[test]
    fn test_route_to_loopback() {
        let platform = SystemPlatform::new();
        let local = platform
            .route_to(SocketAddr::from(([127, 0, 0, 1], 53)))
            .unwrap();

        assert!(local.ip().is_loopback());
    }
}

//! Backend launch specs
//!
//! Every protocol family with a local relay maps to one opaque executable.
//! Some take their configuration on the command line, others read a JSON
//! file generated here.

use crate::args::{quoted, RelayTarget};
use crate::model::{ProtocolFamily, ServerDescriptor};
use crate::readiness::Markers;
use serde_json::json;
use std::path::{Path, PathBuf};

const SHADOWSOCKS_MARKERS: Markers = Markers::new(
    &["listening at"],
    &[
        "Invalid config path",
        "usage",
        "plugin service exit unexpectedly",
    ],
);

const TROJAN_MARKERS: Markers = Markers::new(&["started"], &["exiting"]);

const V2RAY_MARKERS: Markers = Markers::new(&["started"], &["config file not readable", "failed to"]);

/// Config file written before spawning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Everything needed to spawn one relay backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: &'static str,
    pub args: String,
    pub config: Option<GeneratedFile>,
    pub markers: Markers,
}

/// Controller name for a family
pub fn backend_name(family: ProtocolFamily) -> &'static str {
    match family {
        ProtocolFamily::Socks5 => "Socks5",
        ProtocolFamily::Shadowsocks => "Shadowsocks",
        ProtocolFamily::ShadowsocksR => "ShadowsocksR",
        ProtocolFamily::VMess => "V2Ray",
        ProtocolFamily::Trojan => "Trojan",
    }
}

/// Relay executable for a family, `None` for SOCKS5
pub fn executable(family: ProtocolFamily) -> Option<&'static str> {
    match family {
        ProtocolFamily::Socks5 => None,
        ProtocolFamily::Shadowsocks => Some("Shadowsocks.exe"),
        ProtocolFamily::ShadowsocksR => Some("ShadowsocksR.exe"),
        ProtocolFamily::VMess => Some("v2ray.exe"),
        ProtocolFamily::Trojan => Some("Trojan.exe"),
    }
}

/// Launch spec for relaying `server` on `listen`
///
/// `name` keeps generated files of a primary and a sidecar apart. Returns
/// `None` for SOCKS5, which has no local relay.
pub fn launch_spec(
    server: &ServerDescriptor,
    listen: &RelayTarget,
    work_dir: &Path,
    name: &str,
) -> Option<LaunchSpec> {
    let spec = match server.family {
        ProtocolFamily::Socks5 => return None,
        ProtocolFamily::Shadowsocks => LaunchSpec {
            executable: "Shadowsocks.exe",
            args: shadowsocks_args(server, listen),
            config: None,
            markers: SHADOWSOCKS_MARKERS,
        },
        ProtocolFamily::ShadowsocksR => LaunchSpec {
            executable: "ShadowsocksR.exe",
            args: shadowsocksr_args(server, listen),
            config: None,
            markers: SHADOWSOCKS_MARKERS,
        },
        ProtocolFamily::Trojan => {
            let path = config_path(work_dir, name);
            LaunchSpec {
                executable: "Trojan.exe",
                args: format!("-c \"{}\"", path.display()),
                config: Some(GeneratedFile {
                    path,
                    contents: trojan_config(server, listen),
                }),
                markers: TROJAN_MARKERS,
            }
        }
        ProtocolFamily::VMess => {
            let path = config_path(work_dir, name);
            LaunchSpec {
                executable: "v2ray.exe",
                args: format!("-config \"{}\"", path.display()),
                config: Some(GeneratedFile {
                    path,
                    contents: v2ray_config(server, listen),
                }),
                markers: V2RAY_MARKERS,
            }
        }
    };

    Some(spec)
}

fn config_path(work_dir: &Path, name: &str) -> PathBuf {
    work_dir.join(format!("{}.json", name.to_lowercase()))
}

fn password(server: &ServerDescriptor) -> &str {
    server.password.as_deref().unwrap_or_default()
}

fn shadowsocks_args(server: &ServerDescriptor, listen: &RelayTarget) -> String {
    let params = &server.params;
    let mut args = format!(
        "-s {} -p {} -b {} -l {} -m {} -k {} -u",
        server.hostname,
        server.port,
        listen.host,
        listen.port,
        params.method.as_deref().unwrap_or("aes-256-gcm"),
        quoted(password(server)),
    );

    if let Some(plugin) = params.plugin.as_deref().filter(|p| !p.is_empty()) {
        args.push_str(&format!(" --plugin {plugin}"));
        if let Some(options) = params.plugin_options.as_deref().filter(|o| !o.is_empty()) {
            args.push_str(&format!(" --plugin-opts {}", quoted(options)));
        }
    }

    args
}

fn shadowsocksr_args(server: &ServerDescriptor, listen: &RelayTarget) -> String {
    let params = &server.params;
    let mut args = format!(
        "-s {} -p {} -k {} -m {} -b {} -l {}",
        server.hostname,
        server.port,
        quoted(password(server)),
        params.method.as_deref().unwrap_or("aes-256-cfb"),
        listen.host,
        listen.port,
    );

    let optional = [
        ("-O", &params.protocol),
        ("-G", &params.protocol_param),
        ("-o", &params.obfs),
        ("-g", &params.obfs_param),
    ];
    for (flag, value) in optional {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            args.push_str(&format!(" {flag} {}", quoted(value)));
        }
    }

    args.push_str(" -u");
    args
}

fn trojan_config(server: &ServerDescriptor, listen: &RelayTarget) -> String {
    let sni = server.params.sni.as_deref().unwrap_or(&server.hostname);

    json!({
        "run_type": "client",
        "local_addr": listen.host,
        "local_port": listen.port,
        "remote_addr": server.hostname,
        "remote_port": server.port,
        "password": [password(server)],
        "log_level": 1,
        "ssl": {
            "verify": true,
            "verify_hostname": true,
            "sni": sni,
        },
        "tcp": {
            "no_delay": true,
            "keep_alive": true,
        },
    })
    .to_string()
}

fn v2ray_config(server: &ServerDescriptor, listen: &RelayTarget) -> String {
    let params = &server.params;
    let mut stream = json!({
        "network": params.transport.as_deref().unwrap_or("tcp"),
        "security": if params.tls { "tls" } else { "none" },
    });
    if params.tls {
        stream["tlsSettings"] = json!({
            "serverName": params.sni.as_deref().unwrap_or(&server.hostname),
        });
    }

    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "listen": listen.host,
            "port": listen.port,
            "protocol": "socks",
            "settings": { "udp": true, "auth": "noauth" },
        }],
        "outbounds": [{
            "protocol": "vmess",
            "settings": {
                "vnext": [{
                    "address": server.hostname,
                    "port": server.port,
                    "users": [{
                        "id": params.user_id.as_deref().unwrap_or_default(),
                        "alterId": params.alter_id.unwrap_or(0),
                        "security": params.method.as_deref().unwrap_or("auto"),
                    }],
                }],
            },
            "streamSettings": stream,
        }],
    })
    .to_string()
}

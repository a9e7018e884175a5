//! iproute2 backend for device primitives
//!
//! Mutations shell out to `ip`; queries parse its JSON output (`ip -j`).
//! Device existence is checked with the native if_nametoindex(3).

use crate::error::{Error, Result};
use crate::link::{LinkKind, LinkOps};
use ipnet::IpNet;
use serde::Deserialize;
use std::ffi::CString;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct LinkEntry {
    #[serde(default)]
    linkinfo: Option<LinkInfo>,
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddrEntry {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(default)]
    local: Option<IpAddr>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

/// Device primitives backed by the iproute2 `ip` command
#[derive(Debug, Clone)]
pub struct IpRoute {
    binary: PathBuf,
}

impl Default for IpRoute {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ip"),
        }
    }
}

impl IpRoute {
    /// Use `ip` from `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `ip` binary
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        debug!(%command, "running");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| Error::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed {
                command,
                message: stderr.trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    /// Check whether a device exists
    pub fn link_exists(name: &str) -> Result<bool> {
        let name_cstr = CString::new(name)
            .map_err(|e| Error::InvalidConfiguration(format!("Invalid interface name: {}", e)))?;

        let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
        Ok(index != 0)
    }
}

fn parse_kind(json: &[u8]) -> Result<LinkKind> {
    let entries: Vec<LinkEntry> = serde_json::from_slice(json)?;
    let kind = entries
        .into_iter()
        .next()
        .and_then(|entry| entry.linkinfo)
        .and_then(|info| info.info_kind);

    Ok(match kind.as_deref() {
        Some("bridge") => LinkKind::Bridge,
        Some("veth") => LinkKind::Veth,
        _ => LinkKind::Other,
    })
}

fn parse_addresses(json: &[u8]) -> Result<Vec<IpNet>> {
    let entries: Vec<AddrEntry> = serde_json::from_slice(json)?;
    Ok(entries
        .into_iter()
        .flat_map(|entry| entry.addr_info)
        .filter_map(|info| IpNet::new(info.local?, info.prefixlen?).ok())
        .collect())
}

impl LinkOps for IpRoute {
    fn link_kind(&self, name: &str) -> Result<Option<LinkKind>> {
        if !Self::link_exists(name)? {
            return Ok(None);
        }
        let json = self.run(&["-d", "-j", "link", "show", "dev", name])?;
        parse_kind(&json).map(Some)
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        self.run(&["link", "add", "name", name, "type", "bridge"])
            .map(|_| ())
    }

    fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.run(&["link", "add", "name", name, "type", "veth", "peer", "name", peer])
            .map(|_| ())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        if !Self::link_exists(name)? {
            return Err(Error::LinkNotFound(name.to_string()));
        }
        self.run(&["link", "del", "dev", name]).map(|_| ())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.run(&["link", "set", "dev", name, "up"]).map(|_| ())
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.run(&["link", "set", "dev", name, "mtu", &mtu])
            .map(|_| ())
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        self.run(&["link", "set", "dev", name, "master", master])
            .map(|_| ())
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpNet>> {
        let json = self.run(&["-j", "addr", "show", "dev", name])?;
        parse_addresses(&json)
    }

    fn add_address(&self, name: &str, addr: IpNet) -> Result<()> {
        let addr = addr.to_string();
        self.run(&["addr", "add", &addr, "dev", name]).map(|_| ())
    }

    fn del_address(&self, name: &str, addr: IpNet) -> Result<()> {
        let addr = addr.to_string();
        self.run(&["addr", "del", &addr, "dev", name]).map(|_| ())
    }

    fn host_addresses(&self) -> Result<Vec<IpNet>> {
        let json = self.run(&["-j", "addr", "show"])?;
        parse_addresses(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bridge_kind() {
        let json = br#"[{"ifindex":4,"ifname":"tether0","flags":["BROADCAST"],
            "linkinfo":{"info_kind":"bridge","info_data":{"stp_state":0}}}]"#;
        assert_eq!(parse_kind(json).unwrap(), LinkKind::Bridge);
    }

    #[test]
    fn test_parse_kind_without_linkinfo() {
        let json = br#"[{"ifindex":1,"ifname":"lo"}]"#;
        assert_eq!(parse_kind(json).unwrap(), LinkKind::Other);
    }

    #[test]
    fn test_parse_addresses() {
        let json = br#"[{"ifindex":4,"ifname":"tether0","addr_info":[
            {"family":"inet","local":"192.168.1.1","prefixlen":16,"scope":"global"},
            {"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link"}]},
            {"ifindex":5,"ifname":"eth0","addr_info":[]}]"#;

        let addrs = parse_addresses(json).unwrap();
        assert_eq!(
            addrs,
            vec![
                "192.168.1.1/16".parse::<IpNet>().unwrap(),
                "fe80::1/64".parse::<IpNet>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(matches!(
            parse_addresses(b"not json"),
            Err(Error::Json(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_link_exists_check() {
        // lo should always exist
        assert!(IpRoute::link_exists("lo").unwrap());
        // random name should not exist
        assert!(!IpRoute::link_exists("nonexistent123").unwrap());
    }
}

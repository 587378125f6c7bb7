//! Listening TCP sockets from the kernel socket tables.
//!
//! `/proc/<pid>/net/tcp{,6}` list every socket in the pid's network
//! namespace; ownership is established by matching socket inodes against
//! the pid's open file descriptors.

use std::collections::HashSet;
use std::io;
use std::path::Path;

/// `st` column value for a socket in the LISTEN state.
const TCP_LISTEN: &str = "0A";

/// Listening ports owned by `pid`, in socket-table order, deduplicated.
pub fn listening_ports(proc_root: &Path, pid: u32) -> io::Result<Vec<String>> {
    let pid_dir = proc_root.join(pid.to_string());
    let inodes = socket_inodes(&pid_dir.join("fd"))?;
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut ports = Vec::new();
    for table in ["tcp", "tcp6"] {
        let contents = match std::fs::read_to_string(pid_dir.join("net").join(table)) {
            Ok(c) => c,
            // tcp6 is absent when IPv6 is disabled.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for (inode, port) in parse_listen_table(&contents) {
            let port = port.to_string();
            if inodes.contains(&inode) && !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    Ok(ports)
}

/// Inodes of every `socket:[N]` link under a `/proc/<pid>/fd` directory.
fn socket_inodes(fd_dir: &Path) -> io::Result<HashSet<u64>> {
    let mut inodes = HashSet::new();
    for entry in std::fs::read_dir(fd_dir)? {
        let Ok(entry) = entry else { continue };
        // fds close between readdir and readlink; skip those.
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
            inodes.insert(inode);
        }
    }
    Ok(inodes)
}

fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// `(inode, port)` for each LISTEN row of a `/proc/net/tcp`-format table.
pub fn parse_listen_table(contents: &str) -> Vec<(u64, u16)> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse().ok()?;
            Some((inode, port))
        })
        .collect()
}

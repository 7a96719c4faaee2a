//! Linux listener lookup through `/proc`
//!
//! `/proc/net/tcp{,6}` gives the socket inode of every LISTEN entry; the
//! owning pid is found by scanning `/proc/<pid>/fd` for a `socket:[inode]`
//! link. Processes belonging to other users are skipped silently since their
//! fd tables are unreadable.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::trace;

/// TCP state code for LISTEN in /proc/net/tcp
const TCP_LISTEN: u8 = 0x0A;

/// Socket inodes listening on `port` in a `/proc/net/tcp` or `/proc/net/tcp6` dump.
///
/// Format (each line after header):
/// ```text
///    sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 0100007F:4965 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 ...
/// ```
pub(crate) fn listening_inodes(content: &str, port: u16) -> Vec<u64> {
    let mut inodes = Vec::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        // Port is the big-endian hex after the last ':' of the local address
        let local_port = parts[1]
            .rsplit_once(':')
            .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok());
        if local_port != Some(port) {
            continue;
        }

        if u8::from_str_radix(parts[3], 16).ok() != Some(TCP_LISTEN) {
            continue;
        }

        // inode 0 means the socket is being torn down
        match parts[9].parse::<u64>() {
            Ok(inode) if inode != 0 => inodes.push(inode),
            _ => trace!("Skipping /proc/net/tcp line with bad inode: {}", line),
        }
    }

    inodes
}

/// Parse a `/proc/<pid>/fd/*` link target of the form `socket:[12345]`
pub(crate) fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Find the pid of the first process listening on `port`
pub(crate) fn find_listener_pid(port: u16) -> Option<u32> {
    let mut inodes = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match fs::read_to_string(table) {
            Ok(content) => inodes.extend(listening_inodes(&content, port)),
            Err(e) => trace!("Could not read {}: {}", table, e),
        }
    }

    if inodes.is_empty() {
        return None;
    }

    pid_owning_any(Path::new("/proc"), &inodes)
}

fn pid_owning_any(proc_root: &Path, inodes: &HashSet<u64>) -> Option<u32> {
    let entries = fs::read_dir(proc_root).ok()?;

    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };

        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };

        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = target.to_str().and_then(socket_inode) {
                if inodes.contains(&inode) {
                    return Some(pid);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP4: &str = r#"  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:4965 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41001 1 0000000000000000 100 0 0 10 0
   1: 0100007F:4965 0100007F:D2F0 01 00000000:00000000 00:00000000 00000000  1000        0 41002 1 0000000000000000 100 0 0 10 0
   2: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 999 1 0000000000000000 100 0 0 10 0"#;

    #[test]
    fn test_listening_inodes_filters_port_and_state() {
        // 0x4965 = 18789
        assert_eq!(listening_inodes(TCP4, 18789), vec![41001]);
        assert_eq!(listening_inodes(TCP4, 22), vec![999]);
        assert!(listening_inodes(TCP4, 8080).is_empty());
    }

    #[test]
    fn test_listening_inodes_v6() {
        let tcp6 = r#"  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000001000000:4965 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 52000 1 0000000000000000 100 0 0 10 0"#;
        assert_eq!(listening_inodes(tcp6, 18789), vec![52000]);
    }

    #[test]
    fn test_listening_inodes_skips_short_and_zero_inode_lines() {
        let content = "header\n   0: 0100007F:4965\n   1: 0100007F:4965 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 0 1";
        assert!(listening_inodes(content, 18789).is_empty());
    }

    #[test]
    fn test_socket_inode() {
        assert_eq!(socket_inode("socket:[12345]"), Some(12345));
        assert_eq!(socket_inode("pipe:[12345]"), None);
        assert_eq!(socket_inode("/dev/null"), None);
    }

    #[test]
    fn test_find_own_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert_eq!(find_listener_pid(port), Some(std::process::id()));
    }
}

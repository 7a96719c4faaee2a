//! Listener lookup through `lsof` (macOS and other non-Linux unix)

use tokio::process::Command;
use tracing::debug;

/// Owner of a listening socket as reported by `lsof -F`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LsofOwner {
    pub pid: u32,
    pub command: Option<String>,
}

/// Parse `lsof -Fpc` field output; the first process set wins.
///
/// ```text
/// p4242
/// cssh
/// f3
/// ```
pub(crate) fn parse_lsof_fields(output: &str) -> Option<LsofOwner> {
    let mut owner: Option<LsofOwner> = None;

    for line in output.lines() {
        let mut chars = line.chars();
        let tag = chars.next();
        let value = chars.as_str();
        match tag {
            Some('p') => {
                if owner.is_some() {
                    break;
                }
                owner = Some(LsofOwner {
                    pid: value.trim().parse().ok()?,
                    command: None,
                });
            }
            Some('c') => {
                if let Some(owner) = owner.as_mut() {
                    owner.command.get_or_insert_with(|| value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    owner
}

/// Ask `lsof` which process listens on `port`
pub(crate) async fn find_listener(port: u16) -> Option<LsofOwner> {
    let output = Command::new("lsof")
        .args([
            "-nP",
            &format!("-iTCP:{}", port),
            "-sTCP:LISTEN",
            "-Fpc",
        ])
        .output()
        .await
        .map_err(|e| debug!("Failed to run lsof: {}", e))
        .ok()?;

    // lsof exits 1 when nothing matches
    if !output.status.success() || output.stdout.is_empty() {
        return None;
    }

    parse_lsof_fields(&String::from_utf8_lossy(&output.stdout))
}

//! Command-line and cgroup heuristics used by process inspection.
//!
//! Everything here is pure string handling so it can be tested without a
//! live process table.

/// Marker that identifies a launched JVM artifact on a command line.
pub const RUNTIME_MARKER: &str = "-jar";

const ARTIFACT_SUFFIX: &str = ".jar";

/// Whether a command line carries the runtime marker.
pub fn is_runtime_command(command: &str) -> bool {
    command.contains(RUNTIME_MARKER)
}

/// The first `*.jar` token after the runtime marker, as written.
pub fn artifact_path(command: &str) -> Option<&str> {
    let (_, rest) = command.split_once(RUNTIME_MARKER)?;
    rest.split_whitespace()
        .find(|token| token.ends_with(ARTIFACT_SUFFIX))
}

/// Display name for an artifact path.
///
/// Takes the last path segment, drops the `.jar` extension and then strips
/// trailing `-`-separated segments that look like versions or release
/// qualifiers: `lib/app-1.2.3-SNAPSHOT.jar` becomes `app`.
pub fn service_name(artifact: &str) -> String {
    let file = artifact.rsplit('/').next().unwrap_or(artifact);
    let stem = file.strip_suffix(ARTIFACT_SUFFIX).unwrap_or(file);

    let segments: Vec<&str> = stem.split('-').collect();
    let mut keep = segments.len();
    while keep > 1 && is_version_segment(segments[keep - 1]) {
        keep -= 1;
    }
    let name = segments[..keep].join("-");
    if name.is_empty() { stem.to_owned() } else { name }
}

fn is_version_segment(segment: &str) -> bool {
    const QUALIFIERS: [&str; 5] = ["SNAPSHOT", "RELEASE", "FINAL", "GA", "BUILD"];
    segment.starts_with(|c: char| c.is_ascii_digit())
        || QUALIFIERS
            .iter()
            .any(|q| segment.eq_ignore_ascii_case(q))
}

/// Ports named by recognised command-line flags.
///
/// Each flag shape contributes at most its first match, in this order:
/// `--server.port=N`, `-Dserver.port=N`, `port = N` (spaces optional),
/// `-Dport=N`, `PORT=N`. Duplicates are dropped.
pub fn command_line_ports(command: &str) -> Vec<String> {
    let found = [
        number_after(command, "--server.port=", false),
        number_after(command, "-Dserver.port=", false),
        number_after(command, "port", true),
        number_after(command, "-Dport=", false),
        number_after(command, "PORT=", false),
    ];
    merge_ports(&[], &found.into_iter().flatten().collect::<Vec<_>>())
}

/// First run of digits following `needle`.
///
/// With `spaced_equals`, `needle` is followed by optional spaces, `=`, and
/// optional spaces before the digits.
fn number_after(haystack: &str, needle: &str, spaced_equals: bool) -> Option<String> {
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos + needle.len();
        let mut rest = &haystack[start..];
        if spaced_equals {
            rest = rest.trim_start_matches([' ', '\t']);
            match rest.strip_prefix('=') {
                Some(after) => rest = after.trim_start_matches([' ', '\t']),
                None => {
                    from = start;
                    continue;
                }
            }
        }
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            return Some(digits);
        }
        from = start;
    }
    None
}

/// Union of two port lists in first-seen order.
pub fn merge_ports(first: &[String], second: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(first.len() + second.len());
    for port in first.iter().chain(second) {
        if !merged.contains(port) {
            merged.push(port.clone());
        }
    }
    merged
}

/// Container id from `/proc/<pid>/cgroup` contents.
///
/// Shapes are tried in order over the whole file: `/docker/<id>`,
/// `/system.slice/docker-<id>.scope`, `/docker-<id>.scope`.
pub fn container_id_from_cgroup(contents: &str) -> Option<String> {
    capture_id(contents, "/docker/", None)
        .or_else(|| capture_id(contents, "/system.slice/docker-", Some(".scope")))
        .or_else(|| capture_id(contents, "/docker-", Some(".scope")))
        .map(str::to_owned)
}

fn capture_id<'a>(haystack: &'a str, prefix: &str, suffix: Option<&str>) -> Option<&'a str> {
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(prefix) {
        let start = from + pos + prefix.len();
        let tail = &haystack[start..];
        let len = tail
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(tail.len());
        let id = &tail[..len];
        let suffix_ok = suffix.is_none_or(|s| tail[len..].starts_with(s));
        if !id.is_empty() && suffix_ok {
            return Some(id);
        }
        from = start;
    }
    None
}

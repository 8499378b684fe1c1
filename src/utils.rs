use ipnet::IpNet;

/// Expands CIDR blocks into their host addresses; other entries pass through.
/// Duplicates are dropped, first occurrence wins.
pub fn expand_targets<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for entry in entries {
        let entry = entry.as_ref().trim();
        if entry.is_empty() {
            continue;
        }
        let expanded = match entry.parse::<IpNet>() {
            Ok(net) => net.hosts().map(|ip| ip.to_string()).collect(),
            Err(_) => vec![entry.to_string()],
        };
        for target in expanded {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    targets
}

/// Shortens `s` to at most `max` characters for log output.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

//! Discovery argument handling.
//!
//! The broker injects `--min-hostgroup` and `--host-timeout` defaults before
//! handing out discovery tasks, and the timeout sweep reads the same values
//! back to decide when a discovery scan has overrun.

pub const MIN_HOSTGROUP_FLAG: &str = "--min-hostgroup";
pub const HOST_TIMEOUT_FLAG: &str = "--host-timeout";

pub const DEFAULT_MIN_HOSTGROUP: u32 = 64;
/// Twelve hours.
pub const DEFAULT_HOST_TIMEOUT_MINUTES: u32 = 720;

/// Returns `args` with the hostgroup and host-timeout defaults appended when
/// they are missing.
pub fn with_defaults(args: &str) -> String {
    let mut out = args.trim().to_string();
    if !args.contains(MIN_HOSTGROUP_FLAG) {
        push_arg(&mut out, &format!("{MIN_HOSTGROUP_FLAG} {DEFAULT_MIN_HOSTGROUP}"));
    }
    if !args.contains(HOST_TIMEOUT_FLAG) {
        push_arg(&mut out, &format!("{HOST_TIMEOUT_FLAG} {DEFAULT_HOST_TIMEOUT_MINUTES}m"));
    }
    out
}

fn push_arg(out: &mut String, arg: &str) {
    if !out.is_empty() {
        out.push(' ');
    }
    out.push_str(arg);
}

/// Value following `flag`, in either `--flag value` or `--flag=value` form.
fn flag_value<'a>(args: &'a str, flag: &str) -> Option<&'a str> {
    let mut tokens = args.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == flag {
            return tokens.next();
        }
        if let Some(v) = tok.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
            return Some(v);
        }
    }
    None
}

/// Configured `--min-hostgroup`, or the default when absent or unparsable.
pub fn min_hostgroup(args: &str) -> u32 {
    flag_value(args, MIN_HOSTGROUP_FLAG)
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MIN_HOSTGROUP)
}

/// Configured `--host-timeout` in minutes, or the default when absent or
/// unparsable.
pub fn host_timeout_minutes(args: &str) -> u32 {
    flag_value(args, HOST_TIMEOUT_FLAG)
        .and_then(parse_duration_minutes)
        .unwrap_or(DEFAULT_HOST_TIMEOUT_MINUTES)
}

/// Parses an nmap time spec (`500ms`, `30s`, `15m`, `2h` or bare seconds)
/// into whole minutes, rounding up.
pub fn parse_duration_minutes(value: &str) -> Option<u32> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let seconds = match unit {
        "ms" => number / 1000.0,
        "" | "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds / 60.0).ceil() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_injected_once() {
        let out = with_defaults("-Pn -sS");
        assert_eq!(out, "-Pn -sS --min-hostgroup 64 --host-timeout 720m");
        assert_eq!(with_defaults(&out), out);
    }

    #[test]
    fn explicit_values_are_kept_and_parsed() {
        let args = "-sV --min-hostgroup 16 --host-timeout=2h";
        assert_eq!(with_defaults(args), args);
        assert_eq!(min_hostgroup(args), 16);
        assert_eq!(host_timeout_minutes(args), 120);
    }

    #[test]
    fn time_units() {
        assert_eq!(parse_duration_minutes("90"), Some(2));
        assert_eq!(parse_duration_minutes("90s"), Some(2));
        assert_eq!(parse_duration_minutes("120000ms"), Some(2));
        assert_eq!(parse_duration_minutes("45m"), Some(45));
        assert_eq!(parse_duration_minutes("1d"), None);
        assert_eq!(host_timeout_minutes("--host-timeout bogus"), 720);
    }
}

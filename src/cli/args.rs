// src/cli/args.rs

use crate::constants::{REDACTED_ARG_KEYS, USER_ARG_PREFIX};
use std::collections::BTreeMap;

/// Legacy single-letter flags and the long names clap knows them by.
const LEGACY_FLAGS: &[(char, &str)] = &[
    ('i', "input"),
    ('c', "command"),
    ('m', "mosaic-dataset"),
    ('s', "source"),
    ('l', "log"),
    ('b', "code-base"),
    ('p', "param"),
    ('j', "job"),
];

/// Rewrites the legacy `-x:value` spelling into `--long=value`.
///
/// Only the first letter of a legacy flag counts (`-input:a.xml` is `-i`).
/// `-__name:value` becomes `--user-arg=__name=value`. Anything else passes
/// through untouched so clap can report it.
pub fn normalize_legacy_flags<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut iter = args.into_iter();
    let mut out: Vec<String> = iter.next().into_iter().collect();
    for arg in iter {
        if arg.starts_with("--") || !arg.starts_with('-') {
            out.push(arg);
            continue;
        }
        let Some((flag, value)) = arg.get(1..).and_then(|rest| rest.split_once(':')) else {
            out.push(arg);
            continue;
        };
        let flag = flag.to_lowercase();
        if flag.starts_with(USER_ARG_PREFIX) {
            out.push(format!("--user-arg={flag}={}", value.trim()));
            continue;
        }
        let long = flag
            .chars()
            .next()
            .and_then(|c| LEGACY_FLAGS.iter().find(|(short, _)| *short == c))
            .map(|(_, long)| *long);
        match long {
            Some(long) => out.push(format!("--{long}={}", value.trim())),
            None => {
                log::warn!("Ignoring unsupported flag '-{flag}'.");
            }
        }
    }
    out
}

/// `__name=value` pairs into a map; the first value for a name wins.
pub fn parse_user_args(raw: &[String]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for item in raw {
        let (key, value) = item.split_once('=').unwrap_or((item.as_str(), ""));
        let key = key.trim().to_lowercase();
        if key.len() > USER_ARG_PREFIX.len() && key.starts_with(USER_ARG_PREFIX) {
            map.entry(key).or_insert_with(|| value.to_string());
        } else {
            log::warn!("Ignoring user argument '{item}'; names start with '{USER_ARG_PREFIX}'.");
        }
    }
    map
}

/// Splits `<workspace>/<name>.gdb/<md>` into workspace (with a trailing `/`),
/// geodatabase and mosaic dataset. Paths without a `.gdb`/`.sde` parent are
/// not overrides.
pub fn split_mosaic_dataset_path(path: &str) -> Option<(String, String, String)> {
    let normalized = path.trim().replace('\\', "/");
    let (parent, name) = normalized.rsplit_once('/')?;
    let name = name.trim();
    let lower = parent.to_lowercase();
    if name.is_empty() || !(lower.ends_with(".gdb") || lower.ends_with(".sde")) {
        return None;
    }
    let (workspace, geodatabase) = match parent.rsplit_once('/') {
        Some((ws, gdb)) => (format!("{ws}/"), gdb.to_string()),
        None => (String::new(), parent.to_string()),
    };
    Some((workspace, geodatabase, name.to_string()))
}

/// Splits a `-l` value into an optional folder and an optional file name.
pub fn split_log_target(target: &str) -> (Option<String>, Option<String>) {
    let target = target.trim();
    let (folder, file) = match target.rfind(['/', '\\']) {
        Some(pos) => (
            target.get(..pos).unwrap_or_default(),
            target.get(pos + 1..).unwrap_or_default(),
        ),
        None => ("", target),
    };
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    (non_empty(folder), non_empty(file))
}

/// Joins arguments with `||`, hiding values of secret `value$KEY` pairs.
pub fn redact_arguments(args: &[String]) -> String {
    args.iter()
        .map(|item| match item.rsplit_once('$') {
            Some((_, key)) if REDACTED_ARG_KEYS.contains(&key) => format!("REDACTED${key}"),
            _ => item.clone(),
        })
        .collect::<Vec<_>>()
        .join("||")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_legacy_flags_become_long_options() {
        let out = normalize_legacy_flags(argv(&[
            "mdcs",
            "-i:C:\\cfg\\elevation.xml",
            "-c:CM + AF",
            "-s:/data/a",
            "-p:2020$YEAR",
            "-__item:tile-9",
            "--json",
        ]));
        assert_eq!(
            out,
            argv(&[
                "mdcs",
                "--input=C:\\cfg\\elevation.xml",
                "--command=CM + AF",
                "--source=/data/a",
                "--param=2020$YEAR",
                "--user-arg=__item=tile-9",
                "--json",
            ])
        );
    }

    #[test]
    fn test_unknown_legacy_flags_are_dropped() {
        let out = normalize_legacy_flags(argv(&["mdcs", "-artdem:/dem.tif", "-i", "a.xml"]));
        assert_eq!(out, argv(&["mdcs", "-i", "a.xml"]));
    }

    #[test]
    fn test_user_args_keep_first_value() {
        let map = parse_user_args(&argv(&["__Item=a", "__item=b", "plain=c", "__=d"]));
        assert_eq!(map.len(), 1);
        assert_eq!(map["__item"], "a");
    }

    #[test]
    fn test_mosaic_dataset_path_is_split() {
        assert_eq!(
            split_mosaic_dataset_path(r"c:\data\World.gdb\Portland"),
            Some(("c:/data/".to_string(), "World.gdb".to_string(), "Portland".to_string()))
        );
        assert_eq!(
            split_mosaic_dataset_path("conn.sde/md"),
            Some((String::new(), "conn.sde".to_string(), "md".to_string()))
        );
        assert_eq!(split_mosaic_dataset_path("/data/folder/md"), None);
        assert_eq!(split_mosaic_dataset_path("/data/World.gdb/"), None);
    }

    #[test]
    fn test_log_target_splits_folder_and_file() {
        assert_eq!(split_log_target("/tmp/logs/"), (Some("/tmp/logs".to_string()), None));
        assert_eq!(split_log_target("run.xml"), (None, Some("run.xml".to_string())));
        assert_eq!(
            split_log_target("/tmp/logs/run"),
            (Some("/tmp/logs".to_string()), Some("run".to_string()))
        );
    }

    #[test]
    fn test_secret_arguments_are_redacted() {
        let line = redact_arguments(&argv(&["-i:a.xml", "-p:abc123$token", "-p:2020$YEAR"]));
        assert_eq!(line, "-i:a.xml||REDACTED$token||-p:2020$YEAR");
    }
}

// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Read the command list. Blank lines and lines starting with '#' are
/// skipped.
pub fn read_commands<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let body = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    Ok(parse_commands(&body))
}

pub fn parse_commands(body: &str) -> Vec<String> {
    body.lines()
        .map(|line| line.trim())
        .filter(|line| line.len() > 0 && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

pub fn unique_commands(cmds: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    cmds.iter()
        .filter(|cmd| seen.insert(cmd.as_str()))
        .cloned()
        .collect()
}

/// Every unordered pair of distinct commands, in list order.
pub fn command_pairs(cmds: &[String]) -> Vec<[String; 2]> {
    let cmds = unique_commands(cmds);
    let mut pairs = vec![];
    for (i, c0) in cmds.iter().enumerate() {
        for c1 in cmds[i + 1..].iter() {
            pairs.push([c0.clone(), c1.clone()]);
        }
    }
    pairs
}

/// Short name for log files: the executable's basename.
pub fn pretty_name(cmd: &str) -> String {
    let base = match cmd.rfind('/') {
        Some(pos) => &cmd[pos + 1..],
        None => cmd,
    };
    match base.split_whitespace().next() {
        Some(name) => name.to_string(),
        None => "cmd".to_string(),
    }
}

/// `<dir>/<name>.log`, or `<dir>/<name>.<N>.log` with the lowest N not
/// taken yet, so that every step starts with its own log file.
pub fn fresh_log_path(dir: &Path, name: &str) -> PathBuf {
    let mut path = dir.join(format!("{}.log", name));
    let mut idx = 1;
    while path.exists() {
        path = dir.join(format!("{}.{}.log", name, idx));
        idx += 1;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_parse() {
        let body = "# NPB\n./bt.C.x\n\n   \n  ./cg.C.x -v  \n#./ep.C.x\n./bt.C.x\n";
        assert_eq!(parse_commands(body), strs(&["./bt.C.x", "./cg.C.x -v", "./bt.C.x"]));
    }

    #[test]
    fn test_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.txt");
        fs::write(&path, "./a\n# ./b\n./c\n").unwrap();
        assert_eq!(read_commands(&path).unwrap(), strs(&["./a", "./c"]));
        assert!(read_commands(dir.path().join("missing.txt")).is_err());
    }

    #[test]
    fn test_pairs() {
        let cmds = strs(&["a", "b", "a", "c"]);
        assert_eq!(unique_commands(&cmds), strs(&["a", "b", "c"]));

        let pairs = command_pairs(&cmds);
        assert_eq!(
            pairs,
            vec![
                ["a".to_string(), "b".to_string()],
                ["a".to_string(), "c".to_string()],
                ["b".to_string(), "c".to_string()],
            ]
        );
        assert!(command_pairs(&strs(&["a", "a"])).is_empty());
    }

    #[test]
    fn test_pretty_name() {
        assert_eq!(pretty_name("/global/work/share/npb/bt.C.x"), "bt.C.x");
        assert_eq!(pretty_name("./cg.C.x -n 4"), "cg.C.x");
        assert_eq!(pretty_name("stream"), "stream");
        assert_eq!(pretty_name("/"), "cmd");
    }

    #[test]
    fn test_fresh_log_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = fresh_log_path(dir.path(), "bt.C.x-cg.C.x");
        assert_eq!(first, dir.path().join("bt.C.x-cg.C.x.log"));
        assert_eq!(fresh_log_path(dir.path(), "bt.C.x-cg.C.x"), first);

        fs::write(&first, "old\n").unwrap();
        let second = fresh_log_path(dir.path(), "bt.C.x-cg.C.x");
        assert_eq!(second, dir.path().join("bt.C.x-cg.C.x.1.log"));
        fs::write(&second, "").unwrap();
        assert_eq!(
            fresh_log_path(dir.path(), "bt.C.x-cg.C.x"),
            dir.path().join("bt.C.x-cg.C.x.2.log")
        );
    }
}

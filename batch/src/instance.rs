//! Task-instance source: JSON array or JSONL files of repair tasks.
//!
//! Every record is checked against the embedded schema and the id rules
//! before it is scheduled, so a bad dataset fails before any work starts.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const INSTANCE_SCHEMA: &str = include_str!("../schemas/instance.schema.json");

static INSTANCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid id regex"));

/// One repair task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub problem_statement: String,
    /// GitHub `owner/name`, git URL, or local path. Only the local sandbox needs it.
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub base_commit: String,
    /// Remaining dataset fields, kept for round-tripping.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Load and validate all instances in `path`.
///
/// A file whose first non-blank character is `[` is read as a JSON array;
/// anything else is read as JSONL (blank lines skipped).
pub fn load_instances(path: &Path) -> Result<Vec<Instance>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read instances {}", path.display()))?;
    let records = parse_records(&contents).with_context(|| format!("parse {}", path.display()))?;

    let schema: Value = serde_json::from_str(INSTANCE_SCHEMA).context("parse instance schema")?;
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile instance schema")?;

    let mut instances = Vec::with_capacity(records.len());
    let mut seen = HashSet::new();
    for (index, record) in records.into_iter().enumerate() {
        let messages: Vec<String> = validator
            .iter_errors(&record)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!(
                "record {index} failed schema validation:\n- {}",
                messages.join("\n- ")
            );
        }
        let instance: Instance = serde_json::from_value(record)
            .with_context(|| format!("record {index} is not an instance"))?;
        validate_instance_id(&instance.instance_id)
            .with_context(|| format!("record {index} invalid"))?;
        if !seen.insert(instance.instance_id.clone()) {
            bail!("duplicate instance_id {}", instance.instance_id);
        }
        instances.push(instance);
    }
    Ok(instances)
}

fn parse_records(contents: &str) -> Result<Vec<Value>> {
    if contents.trim_start().starts_with('[') {
        return serde_json::from_str(contents).context("parse json array");
    }
    let mut records = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = serde_json::from_str(line)
            .with_context(|| format!("parse jsonl line {}", line_no + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Ids become directory and container names, so they are restricted to a
/// filesystem-safe alphabet.
pub fn validate_instance_id(id: &str) -> Result<()> {
    if id.contains("..") {
        bail!("instance_id '{id}' must not contain '..'");
    }
    if !INSTANCE_ID.is_match(id) {
        bail!("instance_id '{id}' must match [A-Za-z0-9][A-Za-z0-9._-]*");
    }
    Ok(())
}

/// Python-style `start:end` range over the instance list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl Slice {
    /// Parse `start:end`, `:end`, `start:` or a bare `end`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let parse_bound = |raw: &str| -> Result<Option<usize>> {
            let raw = raw.trim();
            if raw.is_empty() {
                return Ok(None);
            }
            raw.parse()
                .map(Some)
                .with_context(|| format!("invalid slice bound '{raw}'"))
        };
        let slice = match spec.split_once(':') {
            Some((start, end)) => Self {
                start: parse_bound(start)?,
                end: parse_bound(end)?,
            },
            None => Self {
                start: None,
                end: parse_bound(spec)?,
            },
        };
        if let (Some(start), Some(end)) = (slice.start, slice.end)
            && start > end
        {
            bail!("slice start {start} is after end {end}");
        }
        Ok(slice)
    }
}

/// Apply the id filter, then the slice, preserving dataset order.
pub fn select(instances: Vec<Instance>, filter: Option<&Regex>, slice: Slice) -> Vec<Instance> {
    let filtered: Vec<Instance> = instances
        .into_iter()
        .filter(|instance| filter.is_none_or(|re| re.is_match(&instance.instance_id)))
        .collect();
    let len = filtered.len();
    let start = slice.start.unwrap_or(0).min(len);
    let end = slice.end.unwrap_or(len).min(len);
    filtered
        .into_iter()
        .skip(start)
        .take(end.saturating_sub(start))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("write");
        path
    }

    #[test]
    fn loads_jsonl_with_extra_fields() {
        let temp = tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            "tasks.jsonl",
            concat!(
                r#"{"instance_id":"astropy__astropy-12907","problem_statement":"bug","repo":"astropy/astropy","base_commit":"abc","version":"4.3"}"#,
                "\n\n",
                r#"{"instance_id":"django__django-11099","problem_statement":"other bug"}"#,
                "\n"
            ),
        );

        let instances = load_instances(&path).expect("load");
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].repo, "astropy/astropy");
        assert_eq!(instances[0].extra["version"], "4.3");
        assert_eq!(instances[1].base_commit, "");
    }

    #[test]
    fn loads_json_array() {
        let temp = tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            "tasks.json",
            r#"  [{"instance_id":"a-1","problem_statement":"x"},{"instance_id":"b-2","problem_statement":"y"}]"#,
        );
        let ids: Vec<String> = load_instances(&path)
            .expect("load")
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(ids, ["a-1", "b-2"]);
    }

    #[test]
    fn rejects_schema_violations() {
        let temp = tempdir().expect("tempdir");
        let path = write(temp.path(), "tasks.jsonl", r#"{"instance_id":"a-1"}"#);
        let err = load_instances(&path).expect_err("missing problem statement");
        assert!(format!("{err:#}").contains("schema validation"));
    }

    #[test]
    fn rejects_unsafe_and_duplicate_ids() {
        let temp = tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            "tasks.jsonl",
            r#"{"instance_id":"../etc","problem_statement":"x"}"#,
        );
        let err = load_instances(&path).expect_err("unsafe id");
        assert!(format!("{err:#}").contains("instance_id"));

        let path = write(
            temp.path(),
            "dupes.jsonl",
            "{\"instance_id\":\"a\",\"problem_statement\":\"x\"}\n{\"instance_id\":\"a\",\"problem_statement\":\"y\"}\n",
        );
        let err = load_instances(&path).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate instance_id a"));
    }

    #[test]
    fn parses_slices() {
        assert_eq!(
            Slice::parse("2:5").expect("slice"),
            Slice {
                start: Some(2),
                end: Some(5)
            }
        );
        assert_eq!(Slice::parse(":3").expect("slice").end, Some(3));
        assert_eq!(Slice::parse("4:").expect("slice").start, Some(4));
        assert_eq!(Slice::parse("7").expect("slice").end, Some(7));
        assert!(Slice::parse("5:2").is_err());
        assert!(Slice::parse("x:").is_err());
    }

    #[test]
    fn selects_by_filter_then_slice() {
        let instances: Vec<Instance> = ["django-1", "flask-1", "django-2", "django-3"]
            .iter()
            .map(|id| Instance {
                instance_id: id.to_string(),
                problem_statement: "x".to_string(),
                repo: String::new(),
                base_commit: String::new(),
                extra: BTreeMap::new(),
            })
            .collect();
        let filter = Regex::new("^django").expect("regex");
        let selected = select(
            instances,
            Some(&filter),
            Slice {
                start: Some(1),
                end: None,
            },
        );
        let ids: Vec<&str> = selected.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, ["django-2", "django-3"]);
    }
}

//! Input variable discovery and values-file generation.
//!
//! Declarations are read from the root module's `*.tf` files with a small
//! brace-matching scanner. Only the attributes needed to prompt the operator
//! are extracted (`description`, `default`, `sensitive`); everything else is
//! left to Terraform.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IacError, IacResult};

/// Values file written at the provisioning root.
pub const VALUES_FILE: &str = "terraform.tfvars";

/// Sample values some archives ship next to their definitions.
pub const EXAMPLE_VALUES_FILE: &str = "terraform.tfvars.example";

/// One declared input variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub description: String,
    /// Default as written (quoted strings unquoted); empty when absent or null
    pub default: String,
    /// Whether the declaration has a `default` attribute at all, including
    /// `default = ""` and `default = null`
    #[serde(default)]
    pub has_default: bool,
    pub sensitive: bool,
    /// Operator-edited value; empty means "use the default"
    pub value: String,
}

impl VariableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            default: String::new(),
            has_default: false,
            sensitive: false,
            value: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = default.into();
        self.has_default = true;
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    /// A variable without a `default` attribute needs a value from the operator.
    pub fn is_required(&self) -> bool {
        !self.has_default
    }
}

/// Ordered variable collection keyed by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableSet {
    vars: Vec<VariableSpec>,
}

impl VariableSet {
    pub fn new(vars: Vec<VariableSpec>) -> Self {
        Self { vars }
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableSpec> {
        self.vars.iter()
    }

    pub fn get(&self, name: &str) -> Option<&VariableSpec> {
        self.vars.iter().find(|v| v.name == name)
    }

    /// Set the operator value of a declared variable. Unknown names are ignored.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> bool {
        match self.vars.iter_mut().find(|v| v.name == name) {
            Some(var) => {
                var.value = value.into();
                true
            }
            None => false,
        }
    }

    /// Required variables that still have no value.
    pub fn missing(&self) -> Vec<&str> {
        self.vars
            .iter()
            .filter(|v| v.is_required() && v.value.trim().is_empty())
            .map(|v| v.name.as_str())
            .collect()
    }

    pub fn as_slice(&self) -> &[VariableSpec] {
        &self.vars
    }
}

fn declaration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^[ \t]*variable[ \t]+"([A-Za-z_][A-Za-z0-9_-]*)"[ \t]*\{"#)
            .expect("valid variable regex")
    })
}

/// Variables declared by the `*.tf` files directly inside `root`.
///
/// Files are read in name order; duplicate names keep the first declaration.
pub fn discover(root: &Path) -> IacResult<Vec<VariableSpec>> {
    let mut files: Vec<PathBuf> = fs::read_dir(root)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "tf"))
        .collect();
    files.sort();

    let mut seen = HashSet::new();
    let mut vars = Vec::new();

    for file in files {
        let source = match fs::read_to_string(&file) {
            Ok(source) => source,
            Err(e) => {
                warn!("Skipping unreadable {:?}: {}", file, e);
                continue;
            }
        };
        for var in parse_variables(&source) {
            if seen.insert(var.name.clone()) {
                vars.push(var);
            } else {
                debug!("Ignoring duplicate variable {} in {:?}", var.name, file);
            }
        }
    }

    info!("Discovered {} variable(s) in {:?}", vars.len(), root);
    Ok(vars)
}

/// Parse every `variable "name" { ... }` block in one source file.
pub fn parse_variables(source: &str) -> Vec<VariableSpec> {
    let mut vars = Vec::new();

    for caps in declaration_regex().captures_iter(source) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let open = whole.end() - 1;
        let Some(close) = matching_close(source, open) else {
            warn!("Unterminated variable block {}", name.as_str());
            continue;
        };

        let mut var = VariableSpec::new(name.as_str());
        for (key, value) in attributes(&source[open + 1..close - 1]) {
            match key {
                "description" => var.description = value,
                "default" => {
                    var.has_default = true;
                    var.default = if value == "null" { String::new() } else { value };
                }
                "sensitive" => var.sensitive = value == "true",
                _ => {}
            }
        }
        vars.push(var);
    }

    vars
}

fn skip_string(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_line(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| start + p + 1)
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

/// Index just past the bracket closing the one at `open`.
fn matching_close(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => i = skip_string(bytes, i),
            b'#' => i = skip_line(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = skip_line(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'{' | b'[' | b'(' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' | b')' => {
                depth = depth.checked_sub(1)?;
                i += 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => i += 1,
        }
    }

    None
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Read a heredoc starting at `start` (`<<EOT` or `<<-EOT`).
fn heredoc(body: &str, start: usize) -> (String, usize) {
    let bytes = body.as_bytes();
    let header_end = skip_line(bytes, start);
    let header = body[start + 2..header_end].trim();
    let (indented, marker) = match header.strip_prefix('-') {
        Some(marker) => (true, marker.trim()),
        None => (false, header),
    };

    let mut lines = Vec::new();
    let mut cursor = header_end;
    while cursor < body.len() {
        let line_end = skip_line(bytes, cursor);
        let line = body[cursor..line_end].trim_end_matches(['\n', '\r']);
        cursor = line_end;
        if line.trim() == marker {
            break;
        }
        lines.push(if indented { line.trim_start() } else { line });
    }

    (lines.join("\n"), cursor)
}

/// Top-level `key = value` attributes of a block body.
fn attributes(body: &str) -> Vec<(&str, String)> {
    let bytes = body.as_bytes();
    let mut attrs = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b if b.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            b'#' => {
                i = skip_line(bytes, i);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = skip_line(bytes, i);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i);
                continue;
            }
            _ => {}
        }

        let key_start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'-') {
            i += 1;
        }
        let key = &body[key_start..i];
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
            i += 1;
        }

        if key.is_empty() || i >= bytes.len() {
            i = skip_line(bytes, i.max(key_start + 1).min(bytes.len()));
            continue;
        }

        match bytes[i] {
            b'=' => {
                i += 1;
                while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
                    i += 1;
                }
                let (value, next) = attribute_value(body, i);
                attrs.push((key, value));
                i = next;
            }
            // nested block such as `validation { ... }`
            b'{' => i = matching_close(body, i).unwrap_or(bytes.len()),
            _ => i = skip_line(bytes, i),
        }
    }

    attrs
}

fn attribute_value(body: &str, start: usize) -> (String, usize) {
    let bytes = body.as_bytes();
    match bytes.get(start) {
        Some(b'"') => {
            let end = skip_string(bytes, start);
            let inner_end = end.saturating_sub(1).max(start + 1);
            (unescape(&body[start + 1..inner_end]), end)
        }
        Some(b'{') | Some(b'[') | Some(b'(') => {
            let end = matching_close(body, start).unwrap_or(bytes.len());
            (body[start..end].to_string(), end)
        }
        Some(b'<') if bytes.get(start + 1) == Some(&b'<') => heredoc(body, start),
        Some(_) => {
            let end = skip_line(bytes, start);
            let raw = &body[start..end];
            let raw = raw.split('#').next().unwrap_or(raw);
            let raw = raw.split("//").next().unwrap_or(raw);
            (raw.trim().to_string(), end)
        }
        None => (String::new(), start),
    }
}

/// Quote a value as an HCL string literal.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Render the values file contents. Variables without a value are omitted.
pub fn render_values(vars: &[VariableSpec]) -> String {
    vars.iter()
        .filter(|v| !v.value.is_empty())
        .map(|v| format!("{} = {}\n", v.name, quote(&v.value)))
        .collect()
}

/// Write `terraform.tfvars` at `root`.
///
/// Returns `None` without touching the filesystem when no variables were
/// discovered.
pub fn materialize(root: &Path, vars: &[VariableSpec]) -> IacResult<Option<PathBuf>> {
    materialize_to(&root.join(VALUES_FILE), vars)
}

/// Like [`materialize`], with an explicit file path. Terraform only loads
/// `terraform.tfvars` and `*.auto.tfvars` on its own.
pub fn materialize_to(path: &Path, vars: &[VariableSpec]) -> IacResult<Option<PathBuf>> {
    if vars.is_empty() {
        debug!("No variables declared, skipping {:?}", path);
        return Ok(None);
    }

    let contents = render_values(vars);

    fs::write(path, contents).map_err(|e| IacError::WriteFailed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let written = vars.iter().filter(|v| !v.value.is_empty()).count();
    info!("Wrote {} value(s) to {:?}", written, path);
    Ok(Some(path.to_path_buf()))
}

/// Whether Terraform loads `path` (relative to the root) without `-var-file`.
pub fn is_auto_loaded(path: &Path) -> bool {
    let at_root = path
        .parent()
        .map_or(true, |parent| parent.as_os_str().is_empty());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    at_root
        && (name == VALUES_FILE
            || name == "terraform.tfvars.json"
            || name.ends_with(".auto.tfvars")
            || name.ends_with(".auto.tfvars.json"))
}

/// Copy `terraform.tfvars.example` at `root` to `terraform.tfvars`.
///
/// Refuses to overwrite an existing `terraform.tfvars`.
pub fn copy_example(root: &Path) -> IacResult<PathBuf> {
    let example = root.join(EXAMPLE_VALUES_FILE);
    let target = root.join(VALUES_FILE);

    if !example.is_file() {
        return Err(IacError::ExampleValuesMissing(example.display().to_string()));
    }
    if target.exists() {
        return Err(IacError::ValuesFileExists(target.display().to_string()));
    }

    fs::copy(&example, &target).map_err(|e| IacError::WriteFailed {
        path: target.display().to_string(),
        message: e.to_string(),
    })?;
    info!("Copied {:?} to {:?}", example, target);
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const VARIABLES_TF: &str = r#"
# Region to deploy into
variable "region" {
  description = "AWS region"
  type        = string
  default     = "us-east-1"
}

variable "instance_count" {
  type    = number
  default = 2 # keep small
}

variable "db_password" {
  description = "Password with a \"quote\" and { brace"
  sensitive   = true
}

variable "tags" {
  type = map(string)
  default = {
    Owner = "platform"
    Env   = "dev"
  }

  validation {
    condition     = length(var.tags) > 0
    error_message = "default = \"nope\""
  }
}

variable "notes" {
  description = <<-EOT
    Free-form notes
    over two lines
  EOT
  default = null
}
"#;

    #[test]
    fn test_parse_variables() {
        let vars = parse_variables(VARIABLES_TF);
        let names: Vec<_> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["region", "instance_count", "db_password", "tags", "notes"]);

        assert_eq!(vars[0].description, "AWS region");
        assert_eq!(vars[0].default, "us-east-1");
        assert_eq!(vars[1].default, "2");
        assert_eq!(vars[2].description, "Password with a \"quote\" and { brace");
        assert!(vars[2].sensitive);
        assert!(vars[2].is_required());
        assert!(vars[3].default.starts_with('{'));
        assert!(vars[3].default.contains("Owner = \"platform\""));
        assert_eq!(vars[4].description, "Free-form notes\nover two lines");
        assert_eq!(vars[4].default, "");
        assert!(vars[4].has_default);
        assert!(!vars[4].is_required());
    }

    #[test]
    fn test_empty_and_null_defaults_are_optional() {
        let vars = parse_variables(
            "variable \"suffix\" {\n  default = \"\"\n}\n\
             variable \"kms_key\" {\n  type    = string\n  default = null\n}\n\
             variable \"owner\" {\n  type = string\n}\n",
        );
        assert_eq!(vars.len(), 3);
        assert!(!vars[0].is_required());
        assert!(!vars[1].is_required());
        assert!(vars[2].is_required());
        assert_eq!(VariableSet::new(vars).missing(), vec!["owner"]);

        assert!(VariableSpec::new("x").is_required());
        assert!(!VariableSpec::new("x").with_default("").is_required());
    }

    #[test]
    fn test_commented_declaration_ignored() {
        let vars = parse_variables("# variable \"old\" {}\nvariable \"new\" {}\n");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "new");
    }

    #[test]
    fn test_discover_keeps_first_duplicate() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("a.tf"),
            "variable \"name\" {\n  default = \"first\"\n}\nvariable \"size\" {}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.tf"),
            "variable \"name\" {\n  default = \"second\"\n}\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("modules")).unwrap();
        fs::write(dir.path().join("modules/inner.tf"), "variable \"inner\" {}\n").unwrap();

        let vars = discover(dir.path()).unwrap();
        let names: Vec<_> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["name", "size"]);
        assert_eq!(vars[0].default, "first");
    }

    #[test]
    fn test_variable_set() {
        let mut set = VariableSet::new(parse_variables(VARIABLES_TF));
        assert_eq!(set.missing(), vec!["db_password"]);

        assert!(set.set("db_password", "hunter2"));
        assert!(!set.set("undeclared", "x"));
        assert!(set.missing().is_empty());
        assert_eq!(set.get("db_password").unwrap().value, "hunter2");
    }

    #[test]
    fn test_render_values_escapes_and_omits_empty() {
        let vars = vec![
            VariableSpec::new("name").with_value("web \"prod\""),
            VariableSpec::new("skipped").with_default("x"),
            VariableSpec::new("path").with_value("C:\\infra ${var}"),
        ];
        assert_eq!(
            render_values(&vars),
            "name = \"web \\\"prod\\\"\"\npath = \"C:\\\\infra $${var}\"\n"
        );
    }

    #[test]
    fn test_materialize_writes_values_file() {
        let dir = tempdir().unwrap();
        let vars = vec![
            VariableSpec::new("region").with_value("eu-west-1"),
            VariableSpec::new("count"),
        ];

        let path = materialize(dir.path(), &vars).unwrap().unwrap();
        assert_eq!(path, dir.path().join(VALUES_FILE));
        assert_eq!(fs::read_to_string(path).unwrap(), "region = \"eu-west-1\"\n");
    }

    #[test]
    fn test_materialize_skipped_without_variables() {
        let dir = tempdir().unwrap();
        assert!(materialize(dir.path(), &[]).unwrap().is_none());
        assert!(!dir.path().join(VALUES_FILE).exists());
    }

    #[test]
    fn test_materialize_write_failure() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let vars = vec![VariableSpec::new("a").with_value("b")];

        let err = materialize(&missing, &vars).unwrap_err();
        assert!(matches!(err, IacError::WriteFailed { .. }));
    }

    #[test]
    fn test_is_auto_loaded() {
        assert!(is_auto_loaded(Path::new("terraform.tfvars")));
        assert!(is_auto_loaded(Path::new("terraform.tfvars.json")));
        assert!(is_auto_loaded(Path::new("prod.auto.tfvars")));
        assert!(!is_auto_loaded(Path::new("operator.tfvars")));
        assert!(!is_auto_loaded(Path::new("vars/terraform.tfvars")));
    }

    #[test]
    fn test_copy_example() {
        let dir = tempdir().unwrap();
        let err = copy_example(dir.path()).unwrap_err();
        assert!(matches!(err, IacError::ExampleValuesMissing(_)));

        fs::write(dir.path().join(EXAMPLE_VALUES_FILE), "region = \"eu-west-1\"\n").unwrap();
        let path = copy_example(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(VALUES_FILE));
        assert_eq!(fs::read_to_string(&path).unwrap(), "region = \"eu-west-1\"\n");
        assert!(dir.path().join(EXAMPLE_VALUES_FILE).is_file());

        // Never overwrites
        fs::write(&path, "region = \"us-east-1\"\n").unwrap();
        let err = copy_example(dir.path()).unwrap_err();
        assert!(matches!(err, IacError::ValuesFileExists(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "region = \"us-east-1\"\n");
    }
}

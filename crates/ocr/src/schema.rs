use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Field '{0}' is declared more than once")]
    DuplicateField(String),
    #[error("Continuation of '{rule}' fills undeclared field '{field}'")]
    UnknownField { rule: String, field: String },
    #[error("Invalid pattern for '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("Pattern for '{field}' has no capture group {group}")]
    InvalidGroup { field: String, group: usize },
    #[error("Invalid schema definition: {0}")]
    Definition(String),
}

/// How OCR text is cut into lines before rules run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSplitMode {
    /// One line per `\n`, each trimmed.
    #[default]
    Raw,
    /// Whitespace-collapsed text as a single line. Continuations never fire.
    Normalized,
}

// ── Compiled rules ────────────────────────────────────────────────────────────

/// A pattern plus the capture group whose (trimmed) text becomes the value.
#[derive(Debug, Clone)]
pub struct Capture {
    pattern: Regex,
    group: usize,
}

impl Capture {
    pub fn new(field: &str, pattern: &str, group: usize) -> Result<Self, ExtractionError> {
        let pattern = Regex::new(pattern).map_err(|source| ExtractionError::InvalidPattern {
            field: field.to_string(),
            source,
        })?;
        if group >= pattern.captures_len() {
            return Err(ExtractionError::InvalidGroup { field: field.to_string(), group });
        }
        Ok(Self { pattern, group })
    }

    fn from_static(pattern: &Regex, group: usize) -> Self {
        Self { pattern: pattern.clone(), group }
    }

    /// The trimmed group text, or `None` when the pattern misses or captures nothing.
    pub fn apply(&self, line: &str) -> Option<String> {
        let caps = self.pattern.captures(line)?;
        let value = caps.get(self.group)?.as_str().trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

/// A field filled from a continuation line without consuming it.
#[derive(Debug, Clone)]
pub struct SubField {
    pub field: String,
    pub capture: Capture,
}

/// Follow-on lines appended to a matched value.
#[derive(Debug, Clone)]
pub struct Continuation {
    pattern: Regex,
    max_lines: Option<usize>,
    sub_fields: Vec<SubField>,
}

impl Continuation {
    pub fn new(pattern: Regex, max_lines: Option<usize>, sub_fields: Vec<SubField>) -> Self {
        Self { pattern, max_lines, sub_fields }
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn max_lines(&self) -> Option<usize> {
        self.max_lines
    }

    pub fn sub_fields(&self) -> &[SubField] {
        &self.sub_fields
    }
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    field: String,
    captures: Vec<Capture>,
    continuation: Option<Continuation>,
}

impl FieldRule {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into(), captures: Vec::new(), continuation: None }
    }

    /// Alternatives are tried in the order they are added.
    pub fn capture(mut self, capture: Capture) -> Self {
        self.captures.push(capture);
        self
    }

    pub fn continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = Some(continuation);
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn continuation_rule(&self) -> Option<&Continuation> {
        self.continuation.as_ref()
    }

    /// First alternative that yields a value. Rules without captures never match
    /// a line on their own; they are filled by another rule's continuation.
    pub fn match_line(&self, line: &str) -> Option<String> {
        self.captures.iter().find_map(|c| c.apply(line))
    }
}

/// Ordered field rules. Order is precedence: the first unset field whose rule
/// matches a line takes that line.
#[derive(Debug, Clone)]
pub struct ExtractionSchema {
    name: String,
    line_split: LineSplitMode,
    rules: Vec<FieldRule>,
}

impl ExtractionSchema {
    pub fn new(
        name: impl Into<String>,
        line_split: LineSplitMode,
        rules: Vec<FieldRule>,
    ) -> Result<Self, ExtractionError> {
        let mut seen: Vec<&str> = Vec::with_capacity(rules.len());
        for rule in &rules {
            if seen.contains(&rule.field()) {
                return Err(ExtractionError::DuplicateField(rule.field.clone()));
            }
            seen.push(rule.field());
        }
        for rule in &rules {
            for sub in rule.continuation.iter().flat_map(|c| &c.sub_fields) {
                if !seen.contains(&sub.field.as_str()) {
                    return Err(ExtractionError::UnknownField {
                        rule: rule.field.clone(),
                        field: sub.field.clone(),
                    });
                }
            }
        }
        Ok(Self { name: name.into(), line_split, rules })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn line_split(&self) -> LineSplitMode {
        self.line_split
    }

    pub fn with_line_split(mut self, mode: LineSplitMode) -> Self {
        self.line_split = mode;
        self
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(FieldRule::field)
    }

    /// Parse a TOML schema definition and compile it.
    pub fn from_toml(content: &str) -> Result<Self, ExtractionError> {
        let def: SchemaDefinition =
            toml::from_str(content).map_err(|e| ExtractionError::Definition(e.to_string()))?;
        Self::from_definition(def)
    }

    pub fn from_definition(def: SchemaDefinition) -> Result<Self, ExtractionError> {
        let rules = def
            .fields
            .into_iter()
            .map(FieldDefinition::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(def.name, def.line_split, rules)
    }
}

// ── Serializable definitions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    #[serde(default)]
    pub line_split: LineSplitMode,
    pub fields: Vec<FieldDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default)]
    pub captures: Vec<CaptureDefinition>,
    pub continuation: Option<ContinuationDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureDefinition {
    pub pattern: String,
    #[serde(default = "default_group")]
    pub group: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationDefinition {
    pub pattern: String,
    pub max_lines: Option<usize>,
    #[serde(default)]
    pub sub_fields: Vec<SubFieldDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubFieldDefinition {
    pub field: String,
    pub pattern: String,
    #[serde(default = "default_group")]
    pub group: usize,
}

fn default_group() -> usize {
    1
}

impl FieldDefinition {
    fn compile(self) -> Result<FieldRule, ExtractionError> {
        let mut rule = FieldRule::new(self.name.clone());
        for c in &self.captures {
            rule = rule.capture(Capture::new(&self.name, &c.pattern, c.group)?);
        }
        if let Some(cont) = self.continuation {
            let pattern = Regex::new(&cont.pattern).map_err(|source| {
                ExtractionError::InvalidPattern { field: self.name.clone(), source }
            })?;
            let sub_fields = cont
                .sub_fields
                .iter()
                .map(|s| {
                    Ok::<_, ExtractionError>(SubField {
                        field: s.field.clone(),
                        capture: Capture::new(&s.field, &s.pattern, s.group)?,
                    })
                })
                .collect::<Result<Vec<_>, ExtractionError>>()?;
            rule = rule.continuation(Continuation::new(pattern, cont.max_lines, sub_fields));
        }
        Ok(rule)
    }
}

// ── Built-in KTP schemas ──────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// Labels tolerate any mix of spaces, colons and dashes between label and value.
re!(re_nik, r"(?:^|\D)(\d{16})(?:\D|$)");
re!(re_nama, r"(?i)Nama\s*[:\-\s]*([A-Z\s\.]+)");
re!(re_ttl, r"(?i)Tempat\s*/\s*Tgl\s*Lahir\s*[:\-\s]*([A-Z\s\.,\d\-/]+)");
re!(re_ttl_bare, r"(?i)([A-Z][a-z]+(?: [A-Z][a-z]+)*)\s*,\s*(\d{2}-\d{2}-\d{4})");
re!(re_jenis_kelamin, r"(?i)Jenis\s*Kelamin\s*[:\-\s]*(LAKI-LAKI|PEREMPUAN)");
re!(re_gol_darah, r"(?i)Gol\.?\s*Darah\s*[:\-\s]*(AB|A|B|O)\b");
re!(re_alamat, r"(?i)Alamat\s*[:\-\s]*(.+)");
re!(re_alamat_cont, r"(?i)^(?:RT|RW|KEL|DESA|KEC|KECAMATAN)\s*[:\-\s]*(.+)");
re!(re_rt_rw, r"(?i)RT\s*/\s*RW\s*[:\-\s]*(\d{3}/\d{3})");
re!(re_kel_desa, r"(?i)^(?:KEL(?:URAHAN)?\.?\s*/\s*DESA|KEL(?:URAHAN)?|DESA)\b\.?\s*[:\-\s]*(.+)");
re!(re_kecamatan, r"(?i)^(?:KECAMATAN|KEC)\b\.?\s*[:\-\s]*(.+)");
re!(re_agama, r"(?i)Agama\s*[:\-\s]*(ISLAM|KRISTEN|KATOLIK|HINDU|BUDHA|KONGHUCU)");
re!(re_status, r"(?i)Status\s*Perkawinan\s*[:\-\s]*(BELUM\s+KAWIN|KAWIN|CERAI\s+HIDUP|CERAI\s+MATI)");
re!(re_pekerjaan, r"(?i)Pekerjaan\s*[:\-\s]*(.+)");
re!(re_kewarganegaraan, r"(?i)Kewarganegaraan\s*[:\-\s]*(WNI|WNA)");
re!(re_berlaku, r"(?i)Berlaku\s*Hingga\s*[:\-\s]*(\d{2}-\d{2}-\d{4}|SEUMUR\s+HIDUP)");

re!(re_nik_bare, r"(\d{16})");
re!(re_nama_loose, r"(?i)Nama\s*[:\-\s]*(.+)");
re!(re_alamat_cont_loose, r"(?i)^(?:RT|RW|KEL|DESA|KEC)\s*[:\-\s]*(.+)");

impl ExtractionSchema {
    /// All 14 KTP fields with enumerated values where the card has a fixed set.
    pub fn detailed() -> Self {
        let capture = Capture::from_static;
        let rules = vec![
            FieldRule::new("nik").capture(capture(re_nik(), 1)),
            FieldRule::new("nama").capture(capture(re_nama(), 1)),
            FieldRule::new("tempat_tgl_lahir")
                .capture(capture(re_ttl(), 1))
                .capture(capture(re_ttl_bare(), 0)),
            FieldRule::new("jenis_kelamin").capture(capture(re_jenis_kelamin(), 1)),
            FieldRule::new("gol_darah").capture(capture(re_gol_darah(), 1)),
            FieldRule::new("alamat")
                .capture(capture(re_alamat(), 1))
                .continuation(Continuation::new(
                    re_alamat_cont().clone(),
                    None,
                    vec![
                        SubField { field: "rt_rw".into(), capture: capture(re_rt_rw(), 1) },
                        SubField { field: "kel_desa".into(), capture: capture(re_kel_desa(), 1) },
                        SubField { field: "kecamatan".into(), capture: capture(re_kecamatan(), 1) },
                    ],
                )),
            FieldRule::new("rt_rw"),
            FieldRule::new("kel_desa"),
            FieldRule::new("kecamatan"),
            FieldRule::new("agama").capture(capture(re_agama(), 1)),
            FieldRule::new("status_perkawinan").capture(capture(re_status(), 1)),
            FieldRule::new("pekerjaan").capture(capture(re_pekerjaan(), 1)),
            FieldRule::new("kewarganegaraan").capture(capture(re_kewarganegaraan(), 1)),
            FieldRule::new("berlaku_hingga").capture(capture(re_berlaku(), 1)),
        ];
        Self { name: "detailed".into(), line_split: LineSplitMode::Raw, rules }
    }

    /// NIK, name and address only, with permissive captures.
    pub fn minimal() -> Self {
        let capture = Capture::from_static;
        let rules = vec![
            FieldRule::new("nik").capture(capture(re_nik_bare(), 1)),
            FieldRule::new("nama").capture(capture(re_nama_loose(), 1)),
            FieldRule::new("alamat")
                .capture(capture(re_alamat(), 1))
                .continuation(Continuation::new(re_alamat_cont_loose().clone(), Some(1), vec![])),
        ];
        Self { name: "minimal".into(), line_split: LineSplitMode::Raw, rules }
    }
}

/// Built-in schema selector, e.g. from a query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    #[default]
    Detailed,
    Minimal,
}

impl SchemaKind {
    pub fn build(self) -> ExtractionSchema {
        match self {
            SchemaKind::Detailed => ExtractionSchema::detailed(),
            SchemaKind::Minimal => ExtractionSchema::minimal(),
        }
    }
}

impl std::fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaKind::Detailed => write!(f, "detailed"),
            SchemaKind::Minimal => write!(f, "minimal"),
        }
    }
}

impl std::str::FromStr for SchemaKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "detailed" => Ok(SchemaKind::Detailed),
            "minimal" => Ok(SchemaKind::Minimal),
            other => Err(format!("Unknown schema: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn detailed_declares_fourteen_fields_in_card_order() {
        let schema = ExtractionSchema::detailed();
        let fields: Vec<&str> = schema.fields().collect();
        assert_eq!(
            fields,
            [
                "nik",
                "nama",
                "tempat_tgl_lahir",
                "jenis_kelamin",
                "gol_darah",
                "alamat",
                "rt_rw",
                "kel_desa",
                "kecamatan",
                "agama",
                "status_perkawinan",
                "pekerjaan",
                "kewarganegaraan",
                "berlaku_hingga",
            ]
        );
    }

    #[test]
    fn builtin_schemas_pass_validation() {
        for schema in [ExtractionSchema::detailed(), ExtractionSchema::minimal()] {
            let rebuilt = ExtractionSchema::new(schema.name(), schema.line_split(), schema.rules().to_vec());
            assert!(rebuilt.is_ok(), "{} failed validation", schema.name());
        }
    }

    #[test]
    fn duplicate_field_rejected() {
        let rules = vec![FieldRule::new("nik"), FieldRule::new("nik")];
        let err = ExtractionSchema::new("dup", LineSplitMode::Raw, rules).unwrap_err();
        assert!(matches!(err, ExtractionError::DuplicateField(f) if f == "nik"));
    }

    #[test]
    fn undeclared_sub_field_rejected() {
        let cont = Continuation::new(
            Regex::new("^RT").unwrap(),
            None,
            vec![SubField { field: "rt_rw".into(), capture: Capture::new("rt_rw", r"(\d+)", 1).unwrap() }],
        );
        let rules = vec![FieldRule::new("alamat").continuation(cont)];
        let err = ExtractionSchema::new("bad", LineSplitMode::Raw, rules).unwrap_err();
        assert!(matches!(err, ExtractionError::UnknownField { .. }));
    }

    #[test]
    fn capture_group_must_exist() {
        let err = Capture::new("nik", r"\d{16}", 1).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidGroup { group: 1, .. }));
        assert!(Capture::new("nik", r"\d{16}", 0).is_ok());
    }

    #[test]
    fn capture_ignores_blank_groups() {
        let c = Capture::new("x", r"Label:(\s*)", 1).unwrap();
        assert_eq!(c.apply("Label:   "), None);
    }

    #[test]
    fn schema_from_toml() {
        let toml = r#"
            name = "sim"
            line_split = "normalized"

            [[fields]]
            name = "nomor"
            captures = [{ pattern = '(\d{12})' }]

            [[fields]]
            name = "alamat"
            captures = [{ pattern = '(?i)Alamat\s*:\s*(.+)', group = 1 }]

            [fields.continuation]
            pattern = '(?i)^RT'
            max_lines = 2
            sub_fields = [{ field = "rt", pattern = '(?i)RT\s*(\d{3})' }]

            [[fields]]
            name = "rt"
        "#;
        let schema = ExtractionSchema::from_toml(toml).unwrap();
        assert_eq!(schema.name(), "sim");
        assert_eq!(schema.line_split(), LineSplitMode::Normalized);
        assert_eq!(schema.fields().collect::<Vec<_>>(), ["nomor", "alamat", "rt"]);
        let cont = schema.rules()[1].continuation_rule().unwrap();
        assert_eq!(cont.max_lines(), Some(2));
        assert_eq!(cont.sub_fields().len(), 1);
    }

    #[test]
    fn schema_from_toml_reports_bad_regex() {
        let toml = r#"
            name = "broken"
            [[fields]]
            name = "nik"
            captures = [{ pattern = '(\d{16' }]
        "#;
        let err = ExtractionSchema::from_toml(toml).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidPattern { ref field, .. } if field == "nik"));
    }

    #[test]
    fn schema_from_toml_reports_syntax_errors() {
        let err = ExtractionSchema::from_toml("name = ").unwrap_err();
        assert!(matches!(err, ExtractionError::Definition(_)));
    }

    #[test]
    fn schema_kind_roundtrip() {
        assert_eq!(SchemaKind::from_str("Minimal").unwrap(), SchemaKind::Minimal);
        assert_eq!(SchemaKind::from_str(&SchemaKind::Detailed.to_string()).unwrap(), SchemaKind::Detailed);
        assert!(SchemaKind::from_str("passport").is_err());
        assert_eq!(SchemaKind::Minimal.build().fields().count(), 3);
    }
}

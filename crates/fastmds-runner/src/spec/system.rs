use super::defaults::Forcefields;
use super::SpecError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Structural-input family of a system, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemFormat {
    Pdb,
    Amber,
    Gromacs,
    Charmm,
}

impl SystemFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemFormat::Pdb => "pdb",
            SystemFormat::Amber => "amber",
            SystemFormat::Gromacs => "gromacs",
            SystemFormat::Charmm => "charmm",
        }
    }
}

impl fmt::Display for SystemFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CHARMM_PARAM_KEYS: &[&str] = &["params", "prm", "rtf", "str"];

/// Classifies a raw system mapping by which keys are present.
/// Priority is pdb > amber > gromacs > charmm; null values count as absent.
pub fn detect_format(raw: &Map<String, Value>) -> Result<SystemFormat, SpecError> {
    let has = |key: &str| raw.get(key).is_some_and(|v| !v.is_null());
    if has("pdb") || has("fixed_pdb") {
        return Ok(SystemFormat::Pdb);
    }
    if has("prmtop") && (has("inpcrd") || has("rst7")) {
        return Ok(SystemFormat::Amber);
    }
    if has("top") && (has("gro") || has("g96")) {
        return Ok(SystemFormat::Gromacs);
    }
    if has("psf") && CHARMM_PARAM_KEYS.iter().any(|k| has(k)) {
        return Ok(SystemFormat::Charmm);
    }
    Err(SpecError::UnrecognizedSystem {
        keys: raw.keys().cloned().collect::<Vec<_>>().join(", "),
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdbInput {
    /// Structure used downstream. Raw input before normalization, the
    /// repaired (or user-fixed) file afterwards.
    pub pdb: Option<PathBuf>,
    pub fixed_pdb: Option<PathBuf>,
    pub source_pdb: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmberInput {
    pub prmtop: PathBuf,
    pub inpcrd: Option<PathBuf>,
    pub rst7: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GromacsInput {
    pub top: PathBuf,
    pub gro: Option<PathBuf>,
    pub g96: Option<PathBuf>,
    pub itp: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharmmInput {
    pub psf: PathBuf,
    pub params: Vec<PathBuf>,
    pub prm: Vec<PathBuf>,
    pub rtf: Vec<PathBuf>,
    pub str_files: Vec<PathBuf>,
    pub crd: PathBuf,
}

impl CharmmInput {
    /// All parameter-family files in `params`, `prm`, `rtf`, `str` order.
    pub fn parameter_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.params
            .iter()
            .chain(&self.prm)
            .chain(&self.rtf)
            .chain(&self.str_files)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemInput {
    Pdb(PdbInput),
    Amber(AmberInput),
    Gromacs(GromacsInput),
    Charmm(CharmmInput),
}

impl SystemInput {
    pub fn format(&self) -> SystemFormat {
        match self {
            SystemInput::Pdb(_) => SystemFormat::Pdb,
            SystemInput::Amber(_) => SystemFormat::Amber,
            SystemInput::Gromacs(_) => SystemFormat::Gromacs,
            SystemInput::Charmm(_) => SystemFormat::Charmm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct SystemSpec {
    pub id: String,
    pub forcefield: Option<Forcefields>,
    pub ph: Option<f64>,
    pub input: SystemInput,
    /// Keys no format consumes; kept so the engine sees them.
    pub extra: BTreeMap<String, Value>,
}

impl SystemSpec {
    pub fn format(&self) -> SystemFormat {
        self.input.format()
    }

    pub fn input_paths(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = Vec::new();
        match &self.input {
            SystemInput::Pdb(p) => {
                paths.extend(p.pdb.as_deref());
                paths.extend(p.source_pdb.as_deref());
                paths.extend(p.fixed_pdb.as_deref());
            }
            SystemInput::Amber(a) => {
                paths.push(&a.prmtop);
                paths.extend(a.inpcrd.as_deref());
                paths.extend(a.rst7.as_deref());
            }
            SystemInput::Gromacs(g) => {
                paths.push(&g.top);
                paths.extend(g.gro.as_deref());
                paths.extend(g.g96.as_deref());
                paths.extend(g.itp.iter().map(PathBuf::as_path));
            }
            SystemInput::Charmm(c) => {
                paths.push(&c.psf);
                paths.extend(c.parameter_files().map(PathBuf::as_path));
                paths.push(&c.crd);
            }
        }
        paths
    }
}

impl TryFrom<Map<String, Value>> for SystemSpec {
    type Error = SpecError;

    fn try_from(raw: Map<String, Value>) -> Result<Self, Self::Error> {
        let mut fields: Map<String, Value> =
            raw.into_iter().filter(|(_, v)| !v.is_null()).collect();
        let format = detect_format(&fields)?;
        // The tag is recomputed on every load; a stale one is dropped.
        fields.remove("type");

        let explicit_id = take_string(&mut fields, "id")?;
        let forcefield = match fields.remove("forcefield") {
            Some(v) => Some(serde_json::from_value::<Forcefields>(v).map_err(|e| {
                SpecError::InvalidField {
                    key: "forcefield".to_string(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };
        let ph = match fields.remove("ph") {
            Some(v) => Some(v.as_f64().ok_or_else(|| SpecError::InvalidField {
                key: "ph".to_string(),
                reason: format!("expected a number, got {}", v),
            })?),
            None => None,
        };

        let input = match format {
            SystemFormat::Pdb => SystemInput::Pdb(PdbInput {
                pdb: take_path(&mut fields, "pdb")?,
                fixed_pdb: take_path(&mut fields, "fixed_pdb")?,
                source_pdb: take_path(&mut fields, "source_pdb")?,
            }),
            SystemFormat::Amber => SystemInput::Amber(AmberInput {
                prmtop: require_path(&mut fields, "prmtop", format)?,
                inpcrd: take_path(&mut fields, "inpcrd")?,
                rst7: take_path(&mut fields, "rst7")?,
            }),
            SystemFormat::Gromacs => SystemInput::Gromacs(GromacsInput {
                top: require_path(&mut fields, "top", format)?,
                gro: take_path(&mut fields, "gro")?,
                g96: take_path(&mut fields, "g96")?,
                itp: take_paths(&mut fields, "itp")?,
                include_dirs: take_paths(&mut fields, "include_dirs")?,
            }),
            SystemFormat::Charmm => {
                let psf = require_path(&mut fields, "psf", format)?;
                let params = take_paths(&mut fields, "params")?;
                let prm = take_paths(&mut fields, "prm")?;
                let rtf = take_paths(&mut fields, "rtf")?;
                let str_files = take_paths(&mut fields, "str")?;
                let crd = take_path(&mut fields, "crd")?.ok_or_else(|| SpecError::MissingKey {
                    format,
                    key: "crd".to_string(),
                })?;
                SystemInput::Charmm(CharmmInput {
                    psf,
                    params,
                    prm,
                    rtf,
                    str_files,
                    crd,
                })
            }
        };

        let id = match explicit_id {
            Some(id) => id,
            None => fallback_id(&input),
        };

        Ok(SystemSpec {
            id,
            forcefield,
            ph,
            input,
            extra: fields.into_iter().collect(),
        })
    }
}

impl From<SystemSpec> for Map<String, Value> {
    fn from(spec: SystemSpec) -> Self {
        let mut out: Map<String, Value> = spec.extra.into_iter().collect();
        out.insert("id".to_string(), Value::String(spec.id));
        out.insert(
            "type".to_string(),
            Value::String(spec.input.format().as_str().to_string()),
        );
        if let Some(ff) = spec.forcefield {
            out.insert("forcefield".to_string(), json_strings(ff.0));
        }
        if let Some(ph) = spec.ph {
            out.insert("ph".to_string(), Value::from(ph));
        }
        match spec.input {
            SystemInput::Pdb(p) => {
                insert_path(&mut out, "pdb", p.pdb);
                insert_path(&mut out, "fixed_pdb", p.fixed_pdb);
                insert_path(&mut out, "source_pdb", p.source_pdb);
            }
            SystemInput::Amber(a) => {
                insert_path(&mut out, "prmtop", Some(a.prmtop));
                insert_path(&mut out, "inpcrd", a.inpcrd);
                insert_path(&mut out, "rst7", a.rst7);
            }
            SystemInput::Gromacs(g) => {
                insert_path(&mut out, "top", Some(g.top));
                insert_path(&mut out, "gro", g.gro);
                insert_path(&mut out, "g96", g.g96);
                insert_paths(&mut out, "itp", &g.itp);
                insert_paths(&mut out, "include_dirs", &g.include_dirs);
            }
            SystemInput::Charmm(c) => {
                insert_path(&mut out, "psf", Some(c.psf));
                insert_path(&mut out, "crd", Some(c.crd));
                insert_paths(&mut out, "params", &c.params);
                insert_paths(&mut out, "prm", &c.prm);
                insert_paths(&mut out, "rtf", &c.rtf);
                insert_paths(&mut out, "str", &c.str_files);
            }
        }
        out
    }
}

fn fallback_id(input: &SystemInput) -> String {
    if let SystemInput::Pdb(p) = input {
        let stem = p
            .pdb
            .as_deref()
            .or(p.fixed_pdb.as_deref())
            .and_then(Path::file_stem)
            .and_then(|s| s.to_str());
        if let Some(stem) = stem {
            return stem.to_string();
        }
    }
    "system".to_string()
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Result<Option<String>, SpecError> {
    match fields.remove(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(SpecError::InvalidField {
            key: key.to_string(),
            reason: format!("expected a string, got {}", other),
        }),
    }
}

fn take_path(fields: &mut Map<String, Value>, key: &str) -> Result<Option<PathBuf>, SpecError> {
    Ok(take_string(fields, key)?
        .filter(|s| !s.is_empty())
        .map(PathBuf::from))
}

fn require_path(
    fields: &mut Map<String, Value>,
    key: &str,
    format: SystemFormat,
) -> Result<PathBuf, SpecError> {
    take_path(fields, key)?.ok_or_else(|| SpecError::MissingKey {
        format,
        key: key.to_string(),
    })
}

fn take_paths(fields: &mut Map<String, Value>, key: &str) -> Result<Vec<PathBuf>, SpecError> {
    match fields.remove(key) {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![PathBuf::from(s)]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(PathBuf::from(s)),
                other => Err(SpecError::InvalidField {
                    key: key.to_string(),
                    reason: format!("expected a path string, got {}", other),
                }),
            })
            .collect(),
        Some(other) => Err(SpecError::InvalidField {
            key: key.to_string(),
            reason: format!("expected a path or a list of paths, got {}", other),
        }),
    }
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().to_string())
}

fn json_strings(items: Vec<String>) -> Value {
    Value::Array(items.into_iter().map(Value::String).collect())
}

fn insert_path(out: &mut Map<String, Value>, key: &str, path: Option<PathBuf>) {
    if let Some(p) = path {
        out.insert(key.to_string(), path_value(&p));
    }
}

fn insert_paths(out: &mut Map<String, Value>, key: &str, paths: &[PathBuf]) {
    if !paths.is_empty() {
        out.insert(
            key.to_string(),
            Value::Array(paths.iter().map(|p| path_value(p)).collect()),
        );
    }
}

//! Converges every system of a job onto a usable structural input.

use crate::engine::StructureRepair;
use crate::error::{io_at, Error, Result};
use crate::spec::{JobSpec, SpecError, SystemFormat, SystemInput, SystemSpec, DEFAULT_PH};
use fastmds_core::{absolutize, ensure_dir};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BUILD_DIR: &str = "_build";

pub fn build_dir(project_root: &Path) -> PathBuf {
    project_root.join(BUILD_DIR)
}

/// Path a raw structure of `system_id` is repaired into.
pub fn fixed_pdb_path(project_root: &Path, system_id: &str) -> PathBuf {
    build_dir(project_root).join(format!("{}_fixed.pdb", system_id))
}

/// pH used to repair a raw structure: the system's own, then the job
/// default, then neutral.
pub fn resolve_ph(system: &SystemSpec, job: &JobSpec) -> f64 {
    system.ph.or(job.defaults.ph).unwrap_or(DEFAULT_PH)
}

/// Returns a normalized copy of `job`. Raw `pdb` systems are repaired into
/// `<project_root>/_build/`; `fixed_pdb` systems are used as-is; parameter
/// file families pass through untouched. Any repair failure aborts.
pub fn normalize<R>(job: &JobSpec, project_root: &Path, repair: &R) -> Result<JobSpec>
where
    R: StructureRepair + ?Sized,
{
    let build = build_dir(project_root);
    ensure_dir(&build).map_err(io_at(&build))?;

    let mut out = job.clone();
    for system in out.systems.iter_mut() {
        let ph = resolve_ph(system, job);
        let id = system.id.clone();
        let format = system.format();
        let SystemInput::Pdb(pdb) = &mut system.input else {
            debug!(system = %id, format = %format, "no preparation needed");
            continue;
        };

        if let Some(fixed) = pdb.fixed_pdb.take() {
            let fixed = absolutize(&fixed).map_err(io_at(&fixed))?;
            debug!(system = %id, path = %fixed.display(), "using pre-fixed structure");
            if let Some(src) = pdb.source_pdb.take() {
                pdb.source_pdb = Some(absolutize(&src).map_err(io_at(&src))?);
            }
            pdb.pdb = Some(fixed.clone());
            pdb.fixed_pdb = Some(fixed);
            continue;
        }

        let raw = pdb.pdb.take().ok_or(SpecError::MissingKey {
            format: SystemFormat::Pdb,
            key: "pdb".to_string(),
        })?;
        let source = absolutize(&raw).map_err(io_at(&raw))?;
        let target = fixed_pdb_path(project_root, &id);
        info!(system = %id, ph, "fixing {} -> {}", source.display(), target.display());
        repair
            .repair(&source, &target, ph)
            .map_err(|source| Error::Repair {
                system_id: id.clone(),
                source,
            })?;
        pdb.source_pdb = Some(source);
        pdb.pdb = Some(target.clone());
        pdb.fixed_pdb = Some(target);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRepair;

    fn job(yaml: &str) -> JobSpec {
        serde_yaml::from_str(yaml).expect("job yaml")
    }

    fn pdb_input(system: &SystemSpec) -> &crate::spec::PdbInput {
        match &system.input {
            SystemInput::Pdb(p) => p,
            other => panic!("expected pdb input, got {:?}", other),
        }
    }

    #[test]
    fn system_ph_overrides_job_default() {
        let root = tempfile::tempdir().expect("tempdir");
        let src = root.path().join("raw.pdb");
        std::fs::write(&src, "ATOM\n").expect("write");
        let job = job(&format!(
            "project: p\ndefaults: {{ ph: 7.0 }}\nsystems: [{{ id: s, pdb: {}, ph: 8.0 }}]\n",
            src.display()
        ));
        let repair = RecordingRepair::default();
        normalize(&job, root.path(), &repair).expect("normalize");
        let calls = repair.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, 8.0);
    }

    #[test]
    fn job_default_ph_then_neutral() {
        let root = tempfile::tempdir().expect("tempdir");
        let src = root.path().join("raw.pdb");
        std::fs::write(&src, "ATOM\n").expect("write");
        let with_default = job(&format!(
            "project: p\ndefaults: {{ ph: 6.5 }}\nsystems: [{{ id: s, pdb: {} }}]\n",
            src.display()
        ));
        let bare = job(&format!("project: p\nsystems: [{{ id: s, pdb: {} }}]\n", src.display()));
        let repair = RecordingRepair::default();
        normalize(&with_default, root.path(), &repair).expect("normalize");
        normalize(&bare, root.path(), &repair).expect("normalize");
        let phs: Vec<f64> = repair.calls().iter().map(|c| c.2).collect();
        assert_eq!(phs, vec![6.5, 7.0]);
    }

    #[test]
    fn raw_structure_is_repaired_into_build_dir() {
        let root = tempfile::tempdir().expect("tempdir");
        let src = root.path().join("raw.pdb");
        std::fs::write(&src, "ATOM\n").expect("write");
        let job = job(&format!("project: p\nsystems: [{{ id: prot, pdb: {} }}]\n", src.display()));
        let repair = RecordingRepair::default();
        let normalized = normalize(&job, root.path(), &repair).expect("normalize");

        let expected = root.path().join("_build").join("prot_fixed.pdb");
        let p = pdb_input(&normalized.systems[0]);
        assert_eq!(p.pdb.as_deref(), Some(expected.as_path()));
        assert_eq!(p.fixed_pdb.as_deref(), Some(expected.as_path()));
        assert_eq!(p.source_pdb.as_deref(), Some(src.as_path()));
        assert!(expected.is_file());
        // the input job is left untouched
        assert_eq!(pdb_input(&job.systems[0]).fixed_pdb, None);
    }

    #[test]
    fn fixed_structures_never_trigger_repair() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = job("project: p\nsystems:\n  - { id: a, fixed_pdb: a.pdb }\n  - { id: b, fixed_pdb: b.pdb, pdb: raw.pdb }\n");
        let repair = RecordingRepair::default();
        let normalized = normalize(&job, root.path(), &repair).expect("normalize");
        assert!(repair.calls().is_empty());
        for system in &normalized.systems {
            let p = pdb_input(system);
            assert!(p.pdb.as_ref().is_some_and(|path| path.is_absolute()));
            assert_eq!(p.pdb, p.fixed_pdb);
        }
        assert!(root.path().join("_build").is_dir());
    }

    #[test]
    fn parameter_families_pass_through() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = job("project: p\nsystems:\n  - { id: amb, prmtop: x.prmtop, inpcrd: x.inpcrd }\n  - { id: gmx, top: t.top, gro: c.gro }\n");
        let repair = RecordingRepair::default();
        let normalized = normalize(&job, root.path(), &repair).expect("normalize");
        assert_eq!(normalized.systems, job.systems);
        assert!(repair.calls().is_empty());
    }

    #[test]
    fn repair_failure_aborts_normalization() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = job("project: p\nsystems:\n  - { id: a, pdb: a.pdb }\n  - { id: b, pdb: b.pdb }\n");
        let repair = RecordingRepair::failing();
        let err = normalize(&job, root.path(), &repair).expect_err("strict repair");
        match err {
            Error::Repair { system_id, .. } => assert_eq!(system_id, "a"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(repair.calls().len(), 1);
    }
}

//! `weft validate`: parse and validate manifests offline.

use std::path::PathBuf;

use anyhow::bail;
use weft_core::workflow::definition;

pub fn validate(files: &[PathBuf]) -> anyhow::Result<()> {
    let mut invalid = 0;
    for path in files {
        match definition::load_workflow_file(path) {
            Ok(wf) => println!(
                "  ✓ {} ({}/{}, {} templates)",
                path.display(),
                wf.metadata.namespace,
                wf.metadata.name,
                wf.spec.templates.len()
            ),
            Err(e) => {
                invalid += 1;
                println!("  ✗ {}: {e}", path.display());
            }
        }
    }
    if invalid > 0 {
        bail!("{invalid} of {} manifests are invalid", files.len());
    }
    Ok(())
}

use std::{fs, path::Path};

use anyhow::{anyhow, Context, Result};

pub const RUN_NOTEBOOK_TEMPLATE: &str = r"# Training Run

<!-- SECTION:overview start -->
<!-- Describe what this run is testing. Left untouched by the trainer. -->
<!-- SECTION:overview end -->

## Configuration

<!-- SECTION:configuration start -->
<!-- Filled in from the command line at the start of every run. -->
<!-- SECTION:configuration end -->

## Learning-Rate Schedule

<!-- SECTION:schedule start -->
<!-- Filled in from the step schedule. -->
<!-- SECTION:schedule end -->

## Metrics

<!-- SECTION:metrics start -->
<!-- Rewritten after every epoch. -->
<!-- SECTION:metrics end -->

## Augmented Samples

<!-- SECTION:samples start -->
<!-- A few training images after the augmentation pipeline. -->
<!-- SECTION:samples end -->

> Sections between `<!-- SECTION:name start/end -->` markers are regenerated; edit outside them.
";

/// Replacement content for one marker-delimited region of a notebook.
#[derive(Clone, Debug)]
pub struct ReportSection {
    id: String,
    content: String,
}

impl ReportSection {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }

    fn markers(&self) -> (String, String) {
        (
            format!("<!-- SECTION:{} start -->", self.id),
            format!("<!-- SECTION:{} end -->", self.id),
        )
    }
}

/// Create the notebook from `template` unless one already exists.
pub fn ensure_report_file(path: &Path, template: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    fs::write(path, template)
        .with_context(|| format!("failed to write notebook template to {}", path.display()))
}

pub fn update_sections(path: &Path, sections: &[ReportSection]) -> Result<()> {
    let original = fs::read_to_string(path)
        .with_context(|| format!("failed to read notebook at {}", path.display()))?;

    let updated = sections
        .iter()
        .try_fold(original, |content, section| replace_section(&content, section))?;

    fs::write(path, updated)
        .with_context(|| format!("failed to write notebook to {}", path.display()))
}

fn replace_section(content: &str, section: &ReportSection) -> Result<String> {
    let (start_marker, end_marker) = section.markers();

    let start = content
        .find(&start_marker)
        .ok_or_else(|| anyhow!("notebook is missing marker {start_marker}"))?;
    let body_start = start + start_marker.len();
    let end = content[body_start..]
        .find(&end_marker)
        .map(|offset| body_start + offset)
        .ok_or_else(|| anyhow!("notebook is missing marker {end_marker}"))?;

    let body = section.content.trim_matches('\n');
    let mut updated = String::with_capacity(content.len() + body.len());
    updated.push_str(&content[..body_start]);
    updated.push('\n');
    if !body.is_empty() {
        updated.push_str(body);
        updated.push('\n');
    }
    updated.push_str(&content[end..]);
    Ok(updated)
}

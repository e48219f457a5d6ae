//! Canonical image references derived from application identity and VCS state.

use std::fmt;

use thiserror::Error;

use crate::core::types::{AppIdentity, BuildRule, Mode, VcsState};

/// Tag that always closes a build-mode tag list.
pub const LATEST_TAG: &str = "latest";
/// Single tag of images built for a local run; never pushed.
pub const EPHEMERAL_TAG: &str = "stmp";
/// Dockerfile used when the active rule does not name one.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("malformed image reference '{reference}': {reason}")]
    MalformedImageReference { reference: String, reason: String },
    #[error("image name can't be empty")]
    EmptyName,
}

impl NameError {
    fn malformed(reference: &str, reason: &str) -> Self {
        NameError::MalformedImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Image name with its ordered tag list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Segment before the first `/`, when present.
    pub registry: Option<String>,
    /// Repository name including the registry segment (`repo/name`).
    pub name: String,
    /// Never empty.
    pub tags: Vec<String>,
    /// Only set for build-mode references.
    pub dockerfile: Option<String>,
}

impl ImageReference {
    /// `name:tag` for every tag, in tag order.
    pub fn all_names(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|tag| format!("{}:{}", self.name, tag))
            .collect()
    }

    /// `name:tag` using the first tag.
    pub fn primary(&self) -> String {
        match self.tags.first() {
            Some(tag) => format!("{}:{}", self.name, tag),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.primary())
    }
}

/// Parse a declared `[registry/]name[:tag]` string.
///
/// At most one `:` and one `/` are accepted. A missing tag means `latest`.
pub fn parse_image_reference(reference: &str) -> Result<ImageReference, NameError> {
    let reference = reference.trim();
    let (name, tag) = match reference.split_once(':') {
        Some((_, rest)) if rest.contains(':') => {
            return Err(NameError::malformed(reference, "more than one ':'"));
        }
        Some((_, "")) => return Err(NameError::malformed(reference, "empty tag")),
        Some((name, tag)) => (name, tag),
        None => (reference, LATEST_TAG),
    };
    let registry = registry_of(name, reference)?;
    Ok(ImageReference {
        registry,
        name: name.to_string(),
        tags: vec![tag.to_string()],
        dockerfile: None,
    })
}

/// Derive the image reference for the application in the given mode.
///
/// `rule` is the active build rule and is only consulted in build mode.
pub fn name_image(
    app: &AppIdentity,
    vcs: &VcsState,
    mode: Mode,
    rule: Option<&BuildRule>,
) -> Result<ImageReference, NameError> {
    match mode {
        Mode::Run => match &app.image {
            Some(image) => parse_image_reference(image),
            None => {
                check_base_name(&app.name)?;
                Ok(ImageReference {
                    registry: None,
                    name: app.name.clone(),
                    tags: vec![EPHEMERAL_TAG.to_string()],
                    dockerfile: None,
                })
            }
        },
        Mode::Build => name_build_image(app, vcs, rule),
    }
}

fn name_build_image(
    app: &AppIdentity,
    vcs: &VcsState,
    rule: Option<&BuildRule>,
) -> Result<ImageReference, NameError> {
    let name = rule
        .and_then(|rule| rule.name.as_deref())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(&app.name)
        .trim();
    check_base_name(name)?;
    if name.contains(':') {
        return Err(NameError::malformed(name, "build names can't carry a tag"));
    }
    let registry = registry_of(name, name)?;

    let mut tags = Vec::with_capacity(vcs.tags.len() + 3);
    if !vcs.branch.is_empty() {
        tags.push(branch_tag(&vcs.branch));
    }
    if !vcs.commit_id.is_empty() {
        tags.push(vcs.short_id.clone());
    }
    tags.extend(vcs.tags.iter().cloned());
    tags.push(LATEST_TAG.to_string());

    let dockerfile = rule
        .and_then(|rule| rule.dockerfile.clone())
        .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string());

    Ok(ImageReference {
        registry,
        name: name.to_string(),
        tags,
        dockerfile: Some(dockerfile),
    })
}

/// Collapse every run of `/` into a single `.` (`feature//x` -> `feature.x`).
pub fn branch_tag(branch: &str) -> String {
    let mut out = String::with_capacity(branch.len());
    let mut in_run = false;
    for ch in branch.chars() {
        if ch == '/' {
            if !in_run {
                out.push('.');
            }
            in_run = true;
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    out
}

fn check_base_name(name: &str) -> Result<(), NameError> {
    if name.trim().is_empty() {
        return Err(NameError::EmptyName);
    }
    Ok(())
}

fn registry_of(name: &str, reference: &str) -> Result<Option<String>, NameError> {
    match name.split_once('/') {
        Some((_, rest)) if rest.contains('/') => {
            Err(NameError::malformed(reference, "more than one '/'"))
        }
        Some((registry, rest)) if registry.is_empty() || rest.is_empty() => {
            Err(NameError::malformed(reference, "empty name segment"))
        }
        Some((registry, _)) => Ok(Some(registry.to_string())),
        None if name.is_empty() => Err(NameError::EmptyName),
        None => Ok(None),
    }
}

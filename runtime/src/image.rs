//! Image reference resolution: strips the scheme prefixes the pipeline engine is
//! allowed to send, falls back to the base resource type, and finally substitutes
//! through the configured resource-type-name -> image map.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

const STRIPPED_PREFIXES: &[&str] = &["docker:///", "docker://", "raw:///"];

/// `<domain>(:<port>)?/` is optional; `<path>` is the only required section;
/// `:<tag>` and `@<algorithm>:<hex>` are both optional. Grammar follows
/// [reference.go](https://github.com/distribution/distribution/blob/v2.7.1/reference/reference.go).
static IMAGE_REFERENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^",
        r"(?:(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)+)(?::[0-9]+)?\/)?",
        r"[a-z0-9]+(?:[_.]|__|[-]*[a-z0-9]+)*(?:\/[a-z0-9]+(?:[_.]|__|[-]*[a-z0-9]+)*)*",
        r"(?::[\w][\w.-]{0,127})?",
        r"(?:@[A-Za-z][A-Za-z0-9]*(?:[+.-_][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,})?",
        r"$"
    ))
    .unwrap()
});

/// A reference that failed the image-name grammar check.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidImageReference(String);

impl std::fmt::Display for InvalidImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid container image reference: {:?}", self.0)
    }
}

impl std::error::Error for InvalidImageReference {}

/// Validates `value` against the container image name grammar (registry,
/// path, tag, digest) without decomposing it — resolution only ever needs a
/// pass/fail verdict, never the individual sections.
fn validate_image_reference(value: &str) -> Result<(), InvalidImageReference> {
    if IMAGE_REFERENCE_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(InvalidImageReference(value.to_owned()))
    }
}

/// Strips a leading scheme prefix from an image reference, if present.
fn strip_prefix(image_ref: &str) -> &str {
    for prefix in STRIPPED_PREFIXES {
        if let Some(stripped) = image_ref.strip_prefix(prefix) {
            return stripped;
        }
    }
    image_ref
}

/// Resolves an image spec into a concrete image reference, following the order
/// mandated by the spec: strip scheme prefix, fall back to the bare resource type
/// if nothing is left, then substitute through the resource-type image map.
///
/// `image_ref` is the spec's image reference (possibly empty or scheme-prefixed).
/// `resource_type` is the base resource type name (e.g. `"git"`), used as a
/// fallback when `image_ref` is empty after stripping, and as the map lookup key.
pub fn resolve_image(
    image_ref: &str,
    resource_type: &str,
    resource_type_images: &HashMap<String, String>,
) -> Result<String, InvalidImageReference> {
    let stripped = strip_prefix(image_ref);
    let candidate = if stripped.is_empty() {
        resource_type
    } else {
        stripped
    };

    let resolved = resource_type_images
        .get(candidate)
        .map(String::as_str)
        .unwrap_or(candidate);

    // Validate the final reference fails fast with a precise parse error rather
    // than being silently handed to the API server.
    validate_image_reference(resolved)?;
    Ok(resolved.to_owned())
}

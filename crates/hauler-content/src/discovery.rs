//! Finding image references in rendered Kubernetes manifests.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;

/// Container lists searched in every document; each item's `image` is collected.
///
/// These are `.spec.template.spec.initContainers[*].image`,
/// `.spec.template.spec.containers[*].image`, `.spec.initContainers[*].image`
/// and `.spec.containers[*].image`.
const CONTAINER_LISTS: [&[&str]; 4] = [
    &["spec", "template", "spec", "initContainers"],
    &["spec", "template", "spec", "containers"],
    &["spec", "initContainers"],
    &["spec", "containers"],
];

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

/// Every image named in the multi-document YAML `rendered`, deduplicated and sorted.
pub fn find_images(rendered: &str) -> Result<Vec<String>> {
    let mut images = BTreeSet::new();
    for (n, document) in serde_yaml::Deserializer::from_str(rendered).enumerate() {
        let value = Value::deserialize(document).with_context(|| format!("Parsing document {n}"))?;
        for path in CONTAINER_LISTS {
            let Some(Value::Sequence(containers)) = lookup(&value, path) else {
                continue;
            };
            images.extend(
                containers
                    .iter()
                    .filter_map(|c| c.get("image")?.as_str())
                    .map(str::trim)
                    .filter(|image| !image.is_empty())
                    .map(str::to_string),
            );
        }
    }
    Ok(images.into_iter().collect())
}

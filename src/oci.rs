use std::fmt;

use camino::Utf8PathBuf;
use indexmap::{IndexMap, IndexSet};

use crate::bind::BoundConfig;

/// A single-architecture image build.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OciImage {
    pub fully_qualified_name: String,
    pub context: Utf8PathBuf,
    pub arguments: Vec<(String, String)>,
    pub arch: Option<String>,
    pub variant: Option<String>,
}

/// A multi-arch manifest assembling per-architecture images.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OciManifest {
    pub fully_qualified_name: String,
    pub images: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OciNode {
    Image(OciImage),
    Manifest(OciManifest),
}

impl OciNode {
    pub fn fully_qualified_name(&self) -> &str {
        match self {
            OciNode::Image(image) => &image.fully_qualified_name,
            OciNode::Manifest(manifest) => &manifest.fully_qualified_name,
        }
    }
}

impl fmt::Display for OciNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fully_qualified_name())
    }
}

/// Maps each OCI operation to the set of operations it depends on.
pub type OciGraph = IndexMap<OciNode, IndexSet<OciNode>>;

/// The nodes lowered from one bound image: its build nodes, plus what
/// dependents of the image must wait on (the manifest when multi-arch,
/// the single image otherwise).
struct LoweredImage {
    builds: Vec<OciNode>,
    provides: Vec<OciNode>,
}

/// Lower a bound config into the graph of OCI operations that produce it.
///
/// An image with architectures becomes one build per architecture, each
/// with an arch-suffixed tag, plus one manifest under the image's own name
/// that depends on all of them. An image without architectures becomes a
/// single build under its own name.
pub fn build_graph(bound_config: &BoundConfig) -> OciGraph {
    let mut oci_graph = OciGraph::new();
    let mut lowered: IndexMap<String, LoweredImage> = IndexMap::new();

    for image_id in bound_config.build_order() {
        let Some(image) = bound_config.get_image(image_id) else {
            continue;
        };
        let base_fqn = image.fully_qualified_name();
        if lowered.contains_key(&base_fqn) {
            // Two ids bound to the same name build once
            continue;
        }

        let arguments = image.build_args();
        let architectures = image.build_architectures();
        if architectures.is_empty() {
            let node = OciNode::Image(OciImage {
                fully_qualified_name: base_fqn.clone(),
                context: image.build_context().to_owned(),
                arguments,
                arch: None,
                variant: None,
            });
            oci_graph.entry(node.clone()).or_default();
            lowered.insert(
                base_fqn,
                LoweredImage {
                    builds: vec![node.clone()],
                    provides: vec![node],
                },
            );
        } else {
            // Per-arch images need temporary tags so they can be added to
            // the manifest published under the image's own name
            let mut builds = Vec::with_capacity(architectures.len());
            for (arch, variant) in architectures {
                let tag_suffix = match variant {
                    Some(variant) => format!("-{arch}-{variant}"),
                    None => format!("-{arch}"),
                };
                let node = OciNode::Image(OciImage {
                    fully_qualified_name: format!("{base_fqn}{tag_suffix}"),
                    context: image.build_context().to_owned(),
                    arguments: arguments.clone(),
                    arch: Some(arch.clone()),
                    variant: variant.clone(),
                });
                oci_graph.entry(node.clone()).or_default();
                builds.push(node);
            }
            let manifest = OciNode::Manifest(OciManifest {
                fully_qualified_name: base_fqn.clone(),
                images: builds
                    .iter()
                    .map(|node| node.fully_qualified_name().to_string())
                    .collect(),
            });
            oci_graph
                .entry(manifest.clone())
                .or_default()
                .extend(builds.iter().cloned());
            lowered.insert(
                base_fqn,
                LoweredImage {
                    builds,
                    provides: vec![manifest],
                },
            );
        }
    }

    // Cross-image edges: every build of a dependent waits on this image's
    // manifest (or single image). Driven through dependents_of so shared
    // dependencies get an edge from every dependent.
    for image_id in bound_config.build_order() {
        let Some(image) = bound_config.get_image(image_id) else {
            continue;
        };
        let provides = lowered
            .get(&image.fully_qualified_name())
            .expect("every bound image was lowered")
            .provides
            .clone();
        for dependent_id in bound_config.dependents_of(image_id) {
            let Some(dependent) = bound_config.get_image(dependent_id) else {
                continue;
            };
            let dependent_builds = lowered
                .get(&dependent.fully_qualified_name())
                .expect("every bound image was lowered")
                .builds
                .clone();
            for build in dependent_builds {
                oci_graph
                    .get_mut(&build)
                    .expect("build node is in the graph")
                    .extend(provides.iter().cloned());
            }
        }
    }

    oci_graph
}

/// Render the graph in DOT format for debugging.
pub fn graph_to_dot(oci_graph: &OciGraph) -> String {
    let mut output = vec!["digraph oci_graph {".to_string()];
    for node in oci_graph.keys() {
        output.push(format!("  \"{node}\";"));
    }
    for (node, dependencies) in oci_graph {
        for dependency in dependencies {
            output.push(format!("  \"{node}\" -> \"{dependency}\";"));
        }
    }
    output.push("}".to_string());
    output.join("\n")
}

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::graph::{self, CycleError};
use crate::oci::{OciGraph, OciImage, OciManifest, OciNode};
use crate::work::{Work, WorkGraph};

fn image_build(image: &OciImage) -> Work {
    let mut argv = vec![
        "buildah".to_string(),
        "bud".to_string(),
        "-t".to_string(),
        image.fully_qualified_name.clone(),
    ];
    for (name, value) in &image.arguments {
        argv.push("--build-arg".to_string());
        argv.push(format!("{name}={value}"));
    }
    if let Some(arch) = &image.arch {
        argv.push("--arch".to_string());
        argv.push(arch.clone());
        if let Some(variant) = &image.variant {
            argv.push("--variant".to_string());
            argv.push(variant.clone());
        }
    }
    Work::retry(Work::Command {
        argv,
        working_directory: Some(image.context.clone()),
    })
}

fn image_push(image: &OciImage) -> Work {
    Work::retry(Work::Command {
        argv: vec![
            "buildah".to_string(),
            "push".to_string(),
            image.fully_qualified_name.clone(),
        ],
        working_directory: None,
    })
}

fn manifest_create(manifest: &OciManifest) -> Work {
    Work::Command {
        argv: vec![
            "buildah".to_string(),
            "manifest".to_string(),
            "create".to_string(),
            manifest.fully_qualified_name.clone(),
        ],
        working_directory: None,
    }
}

fn manifest_add(manifest: &OciManifest) -> Vec<Work> {
    manifest
        .images
        .iter()
        .map(|image_fqn| Work::Command {
            argv: vec![
                "buildah".to_string(),
                "manifest".to_string(),
                "add".to_string(),
                manifest.fully_qualified_name.clone(),
                image_fqn.clone(),
            ],
            working_directory: None,
        })
        .collect()
}

fn manifest_push(manifest: &OciManifest) -> Work {
    Work::retry(Work::Command {
        argv: vec![
            "buildah".to_string(),
            "manifest".to_string(),
            "push".to_string(),
            "--all".to_string(),
            manifest.fully_qualified_name.clone(),
        ],
        working_directory: None,
    })
}

/// Materialize the OCI graph into buildah invocations.
///
/// Every image becomes a retried `buildah bud` in its build context; every
/// manifest becomes a `manifest create` followed by one `manifest add` per
/// member. With `push`, images and manifests also get retried pushes. An
/// image that is a member of a manifest is not pushed on its own, since
/// the manifest push carries it.
pub fn build_graph(oci_graph: &OciGraph, push: bool) -> Result<WorkGraph, CycleError> {
    let mut manifest_members: HashSet<&str> = HashSet::new();
    if push {
        for node in oci_graph.keys() {
            if let OciNode::Manifest(manifest) = node {
                for image_fqn in &manifest.images {
                    manifest_members.insert(image_fqn);
                }
            }
        }
    }

    let mut work_graph = WorkGraph::new();
    // The work a dependent OCI node must wait on, per lowered node
    let mut downstream: IndexMap<OciNode, Vec<Work>> = IndexMap::new();

    for node in graph::topological_order(oci_graph)? {
        let mut prerequisites: Vec<Work> = Vec::new();
        for dependency in &oci_graph[&node] {
            prerequisites.extend(
                downstream
                    .get(dependency)
                    .expect("dependencies are materialized first")
                    .iter()
                    .cloned(),
            );
        }

        match &node {
            OciNode::Image(image) => {
                let build = image_build(image);
                work_graph.insert(build.clone(), prerequisites);
                let last = if push
                    && !manifest_members.contains(image.fully_qualified_name.as_str())
                {
                    let push_work = image_push(image);
                    work_graph.insert(push_work.clone(), vec![build]);
                    push_work
                } else {
                    build
                };
                downstream.insert(node.clone(), vec![last]);
            }
            OciNode::Manifest(manifest) => {
                let create = manifest_create(manifest);
                work_graph.insert(create.clone(), prerequisites);
                let adds = manifest_add(manifest);
                for add in &adds {
                    work_graph.insert(add.clone(), vec![create.clone()]);
                }
                if push {
                    let push_work = manifest_push(manifest);
                    work_graph.insert(push_work.clone(), adds);
                    downstream.insert(node.clone(), vec![push_work]);
                } else {
                    // No single "last" add exists; dependents wait on all
                    // of them
                    downstream.insert(node.clone(), adds);
                }
            }
        }
    }

    Ok(work_graph)
}

#[cfg(test)]
mod tests {
    use crate::bind::BindSource;
    use crate::config::Config;
    use crate::oci;

    use super::*;

    fn materialize(text: &str, parameters: &[(&str, &str)], push: bool) -> WorkGraph {
        let config = Config::parse_str(text).unwrap();
        let source = BindSource::new("__command_line__").arguments(
            parameters
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        );
        let oci_graph = oci::build_graph(&config.bind(source).unwrap());
        build_graph(&oci_graph, push).unwrap()
    }

    fn argv_of(work: &Work) -> &[String] {
        match work {
            Work::Command { argv, .. } => argv,
            Work::Retry { work, .. } => argv_of(work),
        }
    }

    fn find<'a>(graph: &'a WorkGraph, expected_argv: &[&str]) -> &'a Work {
        graph
            .keys()
            .find(|work| argv_of(work) == expected_argv)
            .unwrap_or_else(|| panic!("no work item for {expected_argv:?}"))
    }

    fn is_retried(work: &Work) -> bool {
        matches!(work, Work::Retry { .. })
    }

    const SINGLE_IMAGE: &str = r#"
ros_core:
  name: "ros"
  tag: "${rosdistro}-ros-core"
  build:
    context: "ros2/ros-core"
    args:
      FROM: "${ubuntu_image}"
"#;

    const TWO_IMAGES_AND_GROUP: &str = r#"
ros_core:
  name: "ros"
  tag: "${rosdistro}-ros-core"
  build:
    context: "ros2/ros-core"
    args:
      FROM: "${ubuntu_image}"
ros_base:
  name: "ros"
  tag: "${rosdistro}-ros-base"
  build:
    context: "ros2/ros-base"
    args:
      FROM: ros_core
humble:
  images:
    - ros_core
    - ros_base
  architectures:
    - "amd64"
    - ["arm64", "v8"]
  parameters:
    rosdistro: "humble"
    ubuntu_image: "ubuntu:jammy"
"#;

    #[test]
    fn test_single_image_command() {
        let graph = materialize(
            SINGLE_IMAGE,
            &[
                ("rosdistro", "humble"),
                ("ubuntu_image", "ubuntu:jammy"),
                ("registry", "localhost"),
            ],
            false,
        );
        assert_eq!(graph.len(), 1);

        let work = find(
            &graph,
            &[
                "buildah",
                "bud",
                "-t",
                "localhost/ros:humble-ros-core",
                "--build-arg",
                "FROM=ubuntu:jammy",
            ],
        );
        let Work::Retry { work: inner, .. } = work else {
            panic!("build should be wrapped in retry");
        };
        let Work::Command {
            working_directory, ..
        } = inner.as_ref()
        else {
            panic!("expected a command");
        };
        assert_eq!(working_directory.as_deref(), Some("ros2/ros-core".into()));
        assert!(graph[work].is_empty());
    }

    #[test]
    fn test_multiarch_build_and_manifest_commands() {
        let graph = materialize(TWO_IMAGES_AND_GROUP, &[("registry", "localhost")], false);

        // 4 builds, 2 manifest creates, 4 manifest adds
        assert_eq!(graph.len(), 10);

        let arch_build = find(
            &graph,
            &[
                "buildah",
                "bud",
                "-t",
                "localhost/ros:humble-ros-core-arm64-v8",
                "--build-arg",
                "FROM=ubuntu:jammy",
                "--arch",
                "arm64",
                "--variant",
                "v8",
            ],
        );
        assert!(is_retried(arch_build));
        assert!(graph[arch_build].is_empty());

        let create = find(
            &graph,
            &["buildah", "manifest", "create", "localhost/ros:humble-ros-core"],
        );
        assert!(!is_retried(create));
        let add = find(
            &graph,
            &[
                "buildah",
                "manifest",
                "add",
                "localhost/ros:humble-ros-core",
                "localhost/ros:humble-ros-core-amd64",
            ],
        );
        // Adds wait on the create
        assert_eq!(graph[add], vec![create.clone()]);

        // The dependent's builds wait on both of the core manifest's adds
        let base_build = find(
            &graph,
            &[
                "buildah",
                "bud",
                "-t",
                "localhost/ros:humble-ros-base-amd64",
                "--build-arg",
                "FROM=localhost/ros:humble-ros-core",
                "--arch",
                "amd64",
            ],
        );
        let prerequisites = &graph[base_build];
        assert_eq!(prerequisites.len(), 2);
        assert!(prerequisites.iter().all(|work| {
            argv_of(work)[..4]
                == [
                    "buildah".to_string(),
                    "manifest".to_string(),
                    "add".to_string(),
                    "localhost/ros:humble-ros-core".to_string(),
                ]
        }));
    }

    #[test]
    fn test_push_prunes_manifest_members() {
        let graph = materialize(TWO_IMAGES_AND_GROUP, &[("registry", "localhost")], true);

        // No standalone image pushes: every image belongs to a manifest
        assert!(
            !graph
                .keys()
                .any(|work| argv_of(work)[..2] == ["buildah".to_string(), "push".to_string()]),
            "per-arch images must not be pushed individually"
        );

        // Manifest pushes exist and wait on the manifest's adds
        let manifest_push = find(
            &graph,
            &[
                "buildah",
                "manifest",
                "push",
                "--all",
                "localhost/ros:humble-ros-base",
            ],
        );
        assert!(is_retried(manifest_push));
        let prerequisites = &graph[manifest_push];
        assert_eq!(prerequisites.len(), 2);
        assert!(prerequisites.iter().all(|work| {
            argv_of(work)[..4]
                == [
                    "buildah".to_string(),
                    "manifest".to_string(),
                    "add".to_string(),
                    "localhost/ros:humble-ros-base".to_string(),
                ]
        }));

        // Downstream builds wait on the pushed core manifest, not its adds
        let core_push = find(
            &graph,
            &[
                "buildah",
                "manifest",
                "push",
                "--all",
                "localhost/ros:humble-ros-core",
            ],
        );
        let base_build = find(
            &graph,
            &[
                "buildah",
                "bud",
                "-t",
                "localhost/ros:humble-ros-base-amd64",
                "--build-arg",
                "FROM=localhost/ros:humble-ros-core",
                "--arch",
                "amd64",
            ],
        );
        assert_eq!(graph[base_build], vec![core_push.clone()]);
    }

    #[test]
    fn test_push_of_single_image() {
        let graph = materialize(
            SINGLE_IMAGE,
            &[
                ("rosdistro", "humble"),
                ("ubuntu_image", "ubuntu:jammy"),
                ("registry", "localhost"),
            ],
            true,
        );
        assert_eq!(graph.len(), 2);

        let build = find(
            &graph,
            &[
                "buildah",
                "bud",
                "-t",
                "localhost/ros:humble-ros-core",
                "--build-arg",
                "FROM=ubuntu:jammy",
            ],
        );
        let push = find(&graph, &["buildah", "push", "localhost/ros:humble-ros-core"]);
        assert!(is_retried(push));
        assert_eq!(graph[push], vec![build.clone()]);
    }

    #[test]
    fn test_single_arch_dependency_goes_through_push() {
        let text = r#"
core:
  name: core
  build:
    context: core
base:
  name: base
  build:
    context: base
    args:
      FROM: core
"#;
        let graph = materialize(text, &[("registry", "localhost"), ("tag", "latest")], true);

        let core_push = find(&graph, &["buildah", "push", "localhost/core:latest"]);
        let base_build = find(
            &graph,
            &[
                "buildah",
                "bud",
                "-t",
                "localhost/base:latest",
                "--build-arg",
                "FROM=localhost/core:latest",
            ],
        );
        // The most downstream work for core is its push
        assert_eq!(graph[base_build], vec![core_push.clone()]);
    }
}

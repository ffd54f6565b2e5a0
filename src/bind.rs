use std::fmt;
use std::sync::{Arc, LazyLock, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::{IndexMap, IndexSet};
use regex::Regex;

use crate::config::ConfigError;
use crate::graph;

static PARAM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\s*([A-Za-z0-9_-]+)\s*\}").expect("valid regex"));

/// Names of all `${...}` parameter references in a templated string.
pub fn parameter_names(text: &str) -> impl Iterator<Item = &str> {
    PARAM_REGEX
        .captures_iter(text)
        .map(|captures| captures.get(1).expect("capture group").as_str())
}

/// A single-assignment cell that lets an image template embed a dependent
/// image's eventual fully-qualified name before that name is known.
///
/// One resolver exists per image id. It is created at config-load time,
/// shared (via `Arc`) with every build arg that references the id, and
/// assigned exactly once by the binder after all images are bound.
#[derive(Debug)]
pub struct IdResolver {
    identifier: String,
    resolved: OnceLock<String>,
}

impl IdResolver {
    pub fn new(identifier: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.into(),
            resolved: OnceLock::new(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Assign the fully-qualified name. Assigning twice is an error.
    pub fn resolve(&self, fully_qualified_name: String) -> Result<(), ConfigError> {
        self.resolved
            .set(fully_qualified_name)
            .map_err(|_| ConfigError::AlreadyResolved(self.identifier.clone()))
    }
}

impl fmt::Display for IdResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resolved.get().map_or(&self.identifier, String::as_str))
    }
}

/// A build-arg value: either a templated string or a reference to another
/// image's id, late-resolved to that image's fully-qualified name.
///
/// Cloning a `Reference` clones the handle, not the cell; every copy of a
/// template keeps pointing at the same resolver.
#[derive(Clone, Debug)]
pub enum ArgValue {
    Literal(String),
    Reference(Arc<IdResolver>),
}

impl ArgValue {
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            ArgValue::Literal(text) => Some(text),
            ArgValue::Reference(_) => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Literal(text) => f.write_str(text),
            ArgValue::Reference(resolver) => resolver.fmt(f),
        }
    }
}

/// Skips one `(arch, variant?)` tuple for one image.
///
/// A variant-less exclusion matches only variant-less architecture entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exclusion {
    pub image_id: String,
    pub arch: String,
    pub variant: Option<String>,
}

/// One labeled layer of bindings in a [`BindChain`].
#[derive(Clone, Debug)]
pub struct BindSource {
    source_name: String,
    architectures: Option<Vec<(String, Option<String>)>>,
    arguments: Vec<(String, String)>,
    exclusions: Vec<Exclusion>,
}

impl BindSource {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            architectures: None,
            arguments: Vec::new(),
            exclusions: Vec::new(),
        }
    }

    /// Specify the architectures to build. The empty list means "native
    /// only, no multi-arch" and still wins over later layers.
    pub fn architectures(mut self, architectures: Vec<(String, Option<String>)>) -> Self {
        self.architectures = Some(architectures);
        self
    }

    pub fn arguments(mut self, arguments: Vec<(String, String)>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn exclusions(mut self, exclusions: Vec<Exclusion>) -> Self {
        self.exclusions = exclusions;
        self
    }
}

/// Ordered layers of bindings. The first layer that specifies a value wins.
#[derive(Clone, Debug, Default)]
pub struct BindChain {
    links: Vec<BindSource>,
}

impl BindChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: BindSource) {
        self.links.push(source);
    }

    fn source_names(&self) -> Vec<String> {
        self.links
            .iter()
            .map(|link| link.source_name.clone())
            .collect()
    }

    /// Architectures to build for the named image, or `None` if no layer
    /// specifies any (build native only).
    ///
    /// The winning layer's exclusions for this image are subtracted. A
    /// non-empty list reduced to nothing by exclusions is an error; an
    /// empty manifest would be worse than failing here.
    pub fn architectures_for_image(
        &self,
        image_id: &str,
    ) -> Result<Option<Vec<(String, Option<String>)>>, ConfigError> {
        for link in &self.links {
            let Some(architectures) = &link.architectures else {
                continue;
            };
            let remaining: Vec<(String, Option<String>)> = architectures
                .iter()
                .filter(|(arch, variant)| {
                    !link.exclusions.iter().any(|exclusion| {
                        exclusion.image_id == image_id
                            && exclusion.arch == *arch
                            && exclusion.variant == *variant
                    })
                })
                .cloned()
                .collect();
            if remaining.is_empty() && !architectures.is_empty() {
                return Err(ConfigError::MissingArchitectures(image_id.to_string()));
            }
            return Ok(Some(remaining));
        }
        Ok(None)
    }

    /// Value of the named parameter from the first layer that has it.
    pub fn argument_value(&self, name: &str) -> Result<&str, ConfigError> {
        for link in &self.links {
            if let Some((_, value)) = link.arguments.iter().find(|(arg_name, _)| arg_name == name)
            {
                return Ok(value);
            }
        }
        Err(ConfigError::MissingParameter {
            name: name.to_string(),
            sources: self.source_names(),
        })
    }
}

/// Replace every `${name}` in `template` with the first chain layer's
/// value for `name`. A string with no references passes through unchanged.
pub fn substitute(template: &str, chain: &BindChain) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(template.len());
    let mut tail = 0;
    for captures in PARAM_REGEX.captures_iter(template) {
        let reference = captures.get(0).expect("whole match");
        let name = captures.get(1).expect("capture group").as_str();
        output.push_str(&template[tail..reference.start()]);
        output.push_str(chain.argument_value(name)?);
        tail = reference.end();
    }
    output.push_str(&template[tail..]);
    Ok(output)
}

/// An image template after parameter substitution and architecture
/// resolution, ready for lowering into OCI operations.
#[derive(Clone, Debug)]
pub struct BoundImage {
    pub(crate) id: String,
    pub(crate) registry: String,
    pub(crate) name: String,
    pub(crate) tag: String,
    pub(crate) build_context: Utf8PathBuf,
    pub(crate) build_architectures: Vec<(String, Option<String>)>,
    pub(crate) build_args: Vec<(String, ArgValue)>,
}

impl BoundImage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn build_context(&self) -> &Utf8Path {
        &self.build_context
    }

    pub fn build_architectures(&self) -> &[(String, Option<String>)] {
        &self.build_architectures
    }

    /// Build args with id references rendered as whatever the resolver
    /// currently holds (the fully-qualified name once binding completes).
    pub fn build_args(&self) -> Vec<(String, String)> {
        self.build_args
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect()
    }

    /// `registry/name:tag`, with trailing slashes stripped from the
    /// registry.
    pub fn fully_qualified_name(&self) -> String {
        format!(
            "{}/{}:{}",
            self.registry.trim_end_matches('/'),
            self.name,
            self.tag
        )
    }
}

impl fmt::Display for BoundImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.id)?;
        writeln!(f, "  registry: {}", self.registry)?;
        writeln!(f, "  name: {}", self.name)?;
        writeln!(f, "  tag: {}", self.tag)?;
        writeln!(f, "  build:")?;
        writeln!(f, "    context: {}", self.build_context)?;
        if !self.build_args.is_empty() {
            writeln!(f, "    args:")?;
            for (name, value) in &self.build_args {
                writeln!(f, "      {name}: {value}")?;
            }
        }
        if !self.build_architectures.is_empty() {
            writeln!(f, "    architectures:")?;
            for (arch, variant) in &self.build_architectures {
                match variant {
                    Some(variant) => writeln!(f, "      - [{arch}, {variant}]")?,
                    None => writeln!(f, "      - {arch}")?,
                }
            }
        }
        Ok(())
    }
}

/// Bound images plus the dependency and dependent graphs between them.
#[derive(Debug)]
pub struct BoundConfig {
    dependency_graph: IndexMap<String, Vec<String>>,
    dependent_graph: IndexMap<String, Vec<String>>,
    build_order: Vec<String>,
    images: Vec<BoundImage>,
}

impl BoundConfig {
    pub(crate) fn new(
        graph: IndexMap<String, IndexSet<String>>,
        images: Vec<BoundImage>,
    ) -> Result<Self, ConfigError> {
        let build_order = graph::topological_order(&graph)
            .map_err(|error| ConfigError::Cycle(error.nodes.join(", ")))?;

        let mut dependent_graph: IndexMap<String, Vec<String>> = graph
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        for (id, dependencies) in &graph {
            for dependency in dependencies {
                // Dependencies outside the bound image set (a build arg
                // naming a group) have no dependents entry.
                if let Some(dependents) = dependent_graph.get_mut(dependency) {
                    dependents.push(id.clone());
                }
            }
        }

        let dependency_graph = graph
            .into_iter()
            .map(|(id, dependencies)| (id, dependencies.into_iter().collect()))
            .collect();

        Ok(Self {
            dependency_graph,
            dependent_graph,
            build_order,
            images,
        })
    }

    /// Image ids, dependencies first.
    pub fn build_order(&self) -> &[String] {
        &self.build_order
    }

    pub fn dependencies_of(&self, image_id: &str) -> &[String] {
        self.dependency_graph
            .get(image_id)
            .map_or(&[], Vec::as_slice)
    }

    pub fn dependents_of(&self, image_id: &str) -> &[String] {
        self.dependent_graph
            .get(image_id)
            .map_or(&[], Vec::as_slice)
    }

    pub fn get_image(&self, image_id: &str) -> Option<&BoundImage> {
        self.images.iter().find(|image| image.id == image_id)
    }
}

impl fmt::Display for BoundConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for image in &self.images {
            image.fmt(f)?;
        }
        Ok(())
    }
}

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use thiserror::Error;

use crate::bind::{
    self, ArgValue, BindChain, BindSource, BoundConfig, BoundImage, Exclusion, IdResolver,
};
use crate::graph;

/// Errors from parsing and binding a build configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("config does not have id '{0}'")]
    UnknownId(String),
    #[error("parameter '{name}' was not provided by: {sources:?}")]
    MissingParameter { name: String, sources: Vec<String> },
    #[error("id '{0}' was resolved twice")]
    AlreadyResolved(String),
    #[error("building more than one group at a time is not supported")]
    MultipleGroups,
    #[error("image '{0}' has no architectures left after exclusions")]
    MissingArchitectures(String),
    #[error("dependency cycle among: {0}")]
    Cycle(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawImage {
    registry: Option<String>,
    name: Option<String>,
    tag: Option<String>,
    build: RawBuild,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBuild {
    context: String,
    #[serde(default)]
    args: IndexMap<String, String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    images: Vec<String>,
    architectures: Option<Vec<RawArch>>,
    #[serde(default)]
    parameters: IndexMap<String, String>,
    #[serde(default)]
    exclude: Vec<RawExclude>,
}

/// An architecture entry is either a bare string or an `[arch, variant]`
/// 2-sequence; any other shape fails to parse.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawArch {
    Arch(String),
    ArchVariant(String, String),
}

impl From<RawArch> for (String, Option<String>) {
    fn from(raw: RawArch) -> Self {
        match raw {
            RawArch::Arch(arch) => (arch, None),
            RawArch::ArchVariant(arch, variant) => (arch, Some(variant)),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExclude {
    architecture: RawArch,
    images: Vec<String>,
}

/// A templated image definition to be built.
#[derive(Clone, Debug)]
pub struct ImageTemplate {
    id: String,
    registry: String,
    name: String,
    tag: String,
    build_context: String,
    build_args: Vec<(String, ArgValue)>,
}

impl ImageTemplate {
    fn parse_from(image_id: &str, value: serde_yaml::Value) -> Result<Self, ConfigError> {
        let raw: RawImage = serde_yaml::from_value(value)
            .map_err(|error| ConfigError::Parse(format!("image '{image_id}': {error}")))?;
        Ok(Self {
            id: image_id.to_string(),
            registry: raw.registry.unwrap_or_else(|| "${registry}".to_string()),
            name: raw.name.unwrap_or_else(|| "${name}".to_string()),
            tag: raw.tag.unwrap_or_else(|| "${tag}".to_string()),
            build_context: raw.build.context,
            build_args: raw
                .build
                .args
                .into_iter()
                .map(|(name, value)| (name, ArgValue::Literal(value)))
                .collect(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True if any build-arg value is the given id, whether still a bare
    /// string or already holding a resolver for it.
    pub fn uses_id(&self, exact_id: &str) -> bool {
        if self.id == exact_id {
            return false;
        }
        self.build_args.iter().any(|(_, value)| match value {
            ArgValue::Literal(text) => text == exact_id,
            ArgValue::Reference(resolver) => resolver.identifier() == exact_id,
        })
    }

    /// Replace build-arg values naming the resolver's id with a shared
    /// handle to the resolver.
    fn inject_resolver(&mut self, resolver: &Arc<IdResolver>) {
        if self.id == resolver.identifier() {
            return;
        }
        for (_, value) in &mut self.build_args {
            let references_id = match value {
                ArgValue::Literal(text) => text == resolver.identifier(),
                ArgValue::Reference(existing) => existing.identifier() == resolver.identifier(),
            };
            if references_id {
                *value = ArgValue::Reference(Arc::clone(resolver));
            }
        }
    }

    fn collect_parameters(&self, parameters: &mut BTreeSet<String>) {
        for text in [&self.registry, &self.name, &self.tag, &self.build_context] {
            parameters.extend(bind::parameter_names(text).map(ToString::to_string));
        }
        for (name, value) in &self.build_args {
            parameters.extend(bind::parameter_names(name).map(ToString::to_string));
            if let Some(text) = value.as_literal() {
                parameters.extend(bind::parameter_names(text).map(ToString::to_string));
            }
        }
    }

    /// Substitute the template against the chain, producing a bound image.
    fn bind(&self, chain: &BindChain) -> Result<BoundImage, ConfigError> {
        let mut build_args = Vec::with_capacity(self.build_args.len());
        for (name, value) in &self.build_args {
            let name = bind::substitute(name, chain)?;
            let value = match value {
                ArgValue::Literal(text) => ArgValue::Literal(bind::substitute(text, chain)?),
                ArgValue::Reference(resolver) => ArgValue::Reference(Arc::clone(resolver)),
            };
            build_args.push((name, value));
        }
        Ok(BoundImage {
            id: self.id.clone(),
            registry: bind::substitute(&self.registry, chain)?,
            name: bind::substitute(&self.name, chain)?,
            tag: bind::substitute(&self.tag, chain)?,
            build_context: bind::substitute(&self.build_context, chain)?.into(),
            build_architectures: chain.architectures_for_image(&self.id)?.unwrap_or_default(),
            build_args,
        })
    }
}

impl fmt::Display for ImageTemplate {
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
        Ok(())
    }
}

/// A templated group of images built together with shared parameters and
/// architectures.
#[derive(Clone, Debug)]
pub struct GroupTemplate {
    id: String,
    images: Vec<String>,
    architectures: Vec<(String, Option<String>)>,
    provides_parameters: Vec<(String, String)>,
    exclusions: Vec<Exclusion>,
}

impl GroupTemplate {
    fn parse_from(group_id: &str, value: serde_yaml::Value) -> Result<Self, ConfigError> {
        let raw: RawGroup = serde_yaml::from_value(value)
            .map_err(|error| ConfigError::Parse(format!("group '{group_id}': {error}")))?;
        if raw.images.is_empty() {
            return Err(ConfigError::Parse(format!(
                "group '{group_id}' must list at least one image"
            )));
        }
        let mut exclusions = Vec::new();
        for exclude in raw.exclude {
            let (arch, variant) = exclude.architecture.into();
            for image_id in exclude.images {
                exclusions.push(Exclusion {
                    image_id,
                    arch: arch.clone(),
                    variant: variant.clone(),
                });
            }
        }
        Ok(Self {
            id: group_id.to_string(),
            images: raw.images,
            architectures: raw
                .architectures
                .unwrap_or_default()
                .into_iter()
                .map(Into::into)
                .collect(),
            provides_parameters: raw.parameters.into_iter().collect(),
            exclusions,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn provides_parameters(&self) -> &[(String, String)] {
        &self.provides_parameters
    }

    pub fn exclusions(&self) -> &[Exclusion] {
        &self.exclusions
    }

    /// True if the id appears in the images list or as a literal
    /// provides-parameters value.
    pub fn uses_id(&self, exact_id: &str) -> bool {
        if self.id == exact_id {
            return false;
        }
        self.images.iter().any(|image| image == exact_id)
            || self
                .provides_parameters
                .iter()
                .any(|(_, value)| value == exact_id)
    }

    fn collect_parameters(&self, parameters: &mut BTreeSet<String>) {
        for image in &self.images {
            parameters.extend(bind::parameter_names(image).map(ToString::to_string));
        }
        for (arch, variant) in &self.architectures {
            parameters.extend(bind::parameter_names(arch).map(ToString::to_string));
            if let Some(variant) = variant {
                parameters.extend(bind::parameter_names(variant).map(ToString::to_string));
            }
        }
        for (name, value) in &self.provides_parameters {
            parameters.extend(bind::parameter_names(name).map(ToString::to_string));
            parameters.extend(bind::parameter_names(value).map(ToString::to_string));
        }
        for exclusion in &self.exclusions {
            parameters.extend(bind::parameter_names(&exclusion.arch).map(ToString::to_string));
            if let Some(variant) = &exclusion.variant {
                parameters.extend(bind::parameter_names(variant).map(ToString::to_string));
            }
        }
    }

    /// Substitute the group's own references against the chain and return
    /// it as a bind source for its images.
    fn bind(&self, chain: &BindChain) -> Result<BindSource, ConfigError> {
        let mut architectures = Vec::with_capacity(self.architectures.len());
        for (arch, variant) in &self.architectures {
            let arch = bind::substitute(arch, chain)?;
            let variant = variant
                .as_ref()
                .map(|variant| bind::substitute(variant, chain))
                .transpose()?;
            architectures.push((arch, variant));
        }
        let mut arguments = Vec::with_capacity(self.provides_parameters.len());
        for (name, value) in &self.provides_parameters {
            arguments.push((bind::substitute(name, chain)?, bind::substitute(value, chain)?));
        }
        let mut exclusions = Vec::with_capacity(self.exclusions.len());
        for exclusion in &self.exclusions {
            exclusions.push(Exclusion {
                image_id: exclusion.image_id.clone(),
                arch: bind::substitute(&exclusion.arch, chain)?,
                variant: exclusion
                    .variant
                    .as_ref()
                    .map(|variant| bind::substitute(variant, chain))
                    .transpose()?,
            });
        }
        Ok(BindSource::new(self.id.as_str())
            .architectures(architectures)
            .arguments(arguments)
            .exclusions(exclusions))
    }
}

impl fmt::Display for GroupTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.id)?;
        writeln!(f, "  images:")?;
        for image in &self.images {
            writeln!(f, "    - {image}")?;
        }
        if !self.architectures.is_empty() {
            writeln!(f, "  architectures:")?;
            for (arch, variant) in &self.architectures {
                match variant {
                    Some(variant) => writeln!(f, "    - [{arch}, {variant}]")?,
                    None => writeln!(f, "    - {arch}")?,
                }
            }
        }
        if !self.provides_parameters.is_empty() {
            writeln!(f, "  parameters:")?;
            for (name, value) in &self.provides_parameters {
                writeln!(f, "    {name}: {value}")?;
            }
        }
        if !self.exclusions.is_empty() {
            writeln!(f, "  exclude:")?;
            for exclusion in &self.exclusions {
                match &exclusion.variant {
                    Some(variant) => writeln!(
                        f,
                        "    - {{ architecture: [{}, {variant}], image: {} }}",
                        exclusion.arch, exclusion.image_id
                    )?,
                    None => writeln!(
                        f,
                        "    - {{ architecture: {}, image: {} }}",
                        exclusion.arch, exclusion.image_id
                    )?,
                }
            }
        }
        Ok(())
    }
}

/// A top-level config entry.
#[derive(Clone, Debug)]
pub enum TopLevel {
    Image(ImageTemplate),
    Group(GroupTemplate),
}

impl TopLevel {
    pub fn id(&self) -> &str {
        match self {
            TopLevel::Image(image) => image.id(),
            TopLevel::Group(group) => group.id(),
        }
    }

    fn uses_id(&self, exact_id: &str) -> bool {
        match self {
            TopLevel::Image(image) => image.uses_id(exact_id),
            TopLevel::Group(group) => group.uses_id(exact_id),
        }
    }

    fn collect_parameters(&self, parameters: &mut BTreeSet<String>) {
        match self {
            TopLevel::Image(image) => image.collect_parameters(parameters),
            TopLevel::Group(group) => group.collect_parameters(parameters),
        }
    }
}

impl fmt::Display for TopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopLevel::Image(image) => image.fmt(f),
            TopLevel::Group(group) => group.fmt(f),
        }
    }
}

/// A parsed config: all top-level templates plus the uses-id graph
/// between them.
#[derive(Debug)]
pub struct Config {
    entries: Vec<TopLevel>,
    graph: IndexMap<String, IndexSet<String>>,
    resolvers: IndexMap<String, Arc<IdResolver>>,
    build_order: Vec<String>,
}

impl Config {
    /// Parse a config document describing images and groups to build.
    ///
    /// Each top-level entry is classified by shape: a `build:` section
    /// makes it an image, an `images:` list makes it a group.
    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let document: serde_yaml::Mapping = serde_yaml::from_str(text)
            .map_err(|error| ConfigError::Parse(error.to_string()))?;

        let mut entries = Vec::new();
        for (key, value) in document {
            let Some(id) = key.as_str().map(ToString::to_string) else {
                return Err(ConfigError::Parse(format!(
                    "top level key {key:?} must be a string"
                )));
            };
            let is_image = {
                let Some(mapping) = value.as_mapping() else {
                    return Err(ConfigError::Parse(format!(
                        "top level key '{id}' must be a mapping"
                    )));
                };
                let has_key =
                    |name: &str| mapping.iter().any(|(key, _)| key.as_str() == Some(name));
                if has_key("build") {
                    true
                } else if has_key("images") {
                    false
                } else {
                    return Err(ConfigError::Parse(format!(
                        "'{id}' looks like neither an image nor a group"
                    )));
                }
            };
            if is_image {
                entries.push(TopLevel::Image(ImageTemplate::parse_from(&id, value)?));
            } else {
                entries.push(TopLevel::Group(GroupTemplate::parse_from(&id, value)?));
            }
        }
        Self::new(entries)
    }

    /// Build the uses-id graph over the entries, create one resolver per
    /// image, and share each resolver with every image that references it.
    pub fn new(mut entries: Vec<TopLevel>) -> Result<Self, ConfigError> {
        let mut graph: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for entry in &entries {
            if graph
                .insert(entry.id().to_string(), IndexSet::new())
                .is_some()
            {
                return Err(ConfigError::Parse(format!(
                    "duplicate top level id '{}'",
                    entry.id()
                )));
            }
        }

        for entry in &entries {
            if let TopLevel::Group(group) = entry {
                for image_id in group.images() {
                    // Templated entries can't be checked until bound
                    if !image_id.contains("${") && !graph.contains_key(image_id) {
                        return Err(ConfigError::Parse(format!(
                            "group '{}' lists unknown image '{image_id}'",
                            group.id()
                        )));
                    }
                }
            }
        }

        let mut edges: Vec<(String, String)> = Vec::new();
        for entry in &entries {
            for other in &entries {
                if other.uses_id(entry.id()) {
                    edges.push((other.id().to_string(), entry.id().to_string()));
                }
            }
        }
        for (user, used) in edges {
            graph
                .get_mut(&user)
                .expect("every entry has a graph node")
                .insert(used);
        }

        let mut resolvers = IndexMap::new();
        for entry in &entries {
            if let TopLevel::Image(image) = entry {
                resolvers.insert(image.id().to_string(), IdResolver::new(image.id()));
            }
        }
        for entry in &mut entries {
            if let TopLevel::Image(image) = entry {
                let dependencies: Vec<String> = graph
                    .get(image.id())
                    .expect("every entry has a graph node")
                    .iter()
                    .cloned()
                    .collect();
                for dependency in dependencies {
                    if let Some(resolver) = resolvers.get(&dependency) {
                        image.inject_resolver(resolver);
                    }
                }
            }
        }

        let build_order = graph::topological_order(&graph)
            .map_err(|error| ConfigError::Cycle(error.nodes.join(", ")))?;

        Ok(Self {
            entries,
            graph,
            resolvers,
            build_order,
        })
    }

    /// Top-level ids, dependencies first.
    pub fn build_order(&self) -> &[String] {
        &self.build_order
    }

    pub fn get_top_level(&self, id: &str) -> Option<&TopLevel> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    /// Every `${...}` name appearing anywhere in the config, sorted.
    ///
    /// Names a group provides values for are still reported; the command
    /// line may override them.
    pub fn parameters(&self) -> Vec<String> {
        let mut parameters = BTreeSet::new();
        for entry in &self.entries {
            entry.collect_parameters(&mut parameters);
        }
        parameters.into_iter().collect()
    }

    fn collect_dependencies(&self, id: &str, collected: &mut IndexSet<String>) {
        let Some(dependencies) = self.graph.get(id) else {
            return;
        };
        for dependency in dependencies {
            if collected.insert(dependency.clone()) {
                self.collect_dependencies(dependency, collected);
            }
        }
    }

    /// A config holding just the wanted ids and the transitive closure of
    /// their dependencies, in document order.
    pub fn partial_config(&self, wanted_ids: &[&str]) -> Result<Config, ConfigError> {
        let mut keep: IndexSet<String> = IndexSet::new();
        for id in wanted_ids {
            if !self.graph.contains_key(*id) {
                return Err(ConfigError::UnknownId((*id).to_string()));
            }
            keep.insert((*id).to_string());
            self.collect_dependencies(id, &mut keep);
        }
        let entries = self
            .entries
            .iter()
            .filter(|entry| keep.contains(entry.id()))
            .cloned()
            .collect();
        Config::new(entries)
    }

    fn groups(&self) -> impl Iterator<Item = &GroupTemplate> {
        self.entries.iter().filter_map(|entry| match entry {
            TopLevel::Group(group) => Some(group),
            TopLevel::Image(_) => None,
        })
    }

    /// Bind every image against the layered chain: command line first,
    /// then the group (if any), then the image defaults.
    ///
    /// Images are bound in reverse topological order, then each image's
    /// resolver is assigned its fully-qualified name exactly once.
    pub fn bind(&self, cli_source: BindSource) -> Result<BoundConfig, ConfigError> {
        let mut groups = self.groups();
        let group = groups.next();
        if groups.next().is_some() {
            return Err(ConfigError::MultipleGroups);
        }

        let mut chain = BindChain::new();
        chain.push(cli_source);
        if let Some(group) = group {
            let source = group.bind(&chain)?;
            chain.push(source);
        }
        chain.push(BindSource::new("__image_defaults__").arguments(vec![
            ("registry".to_string(), "localhost".to_string()),
            ("tag".to_string(), "latest".to_string()),
        ]));

        let mut bound_images = Vec::new();
        for id in self.build_order.iter().rev() {
            if let Some(TopLevel::Image(image)) = self.get_top_level(id) {
                bound_images.push(image.bind(&chain)?);
            }
        }

        for image in &bound_images {
            let resolver = self
                .resolvers
                .get(image.id())
                .expect("every image has a resolver");
            resolver.resolve(image.fully_qualified_name())?;
        }
        tracing::debug!(images = bound_images.len(), "bound images");

        let mut image_graph = IndexMap::new();
        for image in &bound_images {
            let dependencies = self
                .graph
                .get(image.id())
                .expect("every image has a graph node")
                .clone();
            image_graph.insert(image.id().to_string(), dependencies);
        }
        BoundConfig::new(image_graph, bound_images)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            if let TopLevel::Image(image) = entry {
                image.fmt(f)?;
            }
        }
        for entry in &self.entries {
            if let TopLevel::Group(group) = entry {
                group.fmt(f)?;
            }
        }
        Ok(())
    }
}

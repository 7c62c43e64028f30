//! Chart mover orchestration.
//!
//! Construction runs every read-only step of a move (load the chart, find
//! the hints, resolve and pull the images, compute the rewrites) so the plan
//! can be inspected before [`ChartMover::move_chart`] writes anything.
//!
//! ```text
//! Uninitialized → ChartLoaded → HintsLoaded → ImagesLoaded → ChangesComputed
//!                                                                │
//!                                               ┌────────────────┴─────┐
//!                                               ▼                      ▼
//!                                             Moved                Archived
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relok_core::config::MoverConfig;
use relok_core::error::{MoverError, Result};
use relok_core::request::{ChartMoveRequest, ChartSpec};
use tempfile::TempDir;

use crate::bundle::{ImageTarball, IntermediateBundle, CHART_DIR, IMAGES_ENTRY};
use crate::cache::LayerCache;
use crate::chart::{self, Chart};
use crate::hints::{load_hints, Hints};
use crate::oci::{
    push_with_retry, ContainerRegistry, Image, ImageReference, RegistryAuth, RegistryClient,
};
use crate::patch::{self, find_chart_destination};
use crate::rewrite::{compute_rewrites, RewriteAction};
use crate::template::ImageTemplate;

/// Lifecycle of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoverState {
    Uninitialized,
    ChartLoaded,
    HintsLoaded,
    ImagesLoaded,
    ChangesComputed,
    Moved,
    Archived,
}

impl std::fmt::Display for MoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MoverState::Uninitialized => "uninitialized",
            MoverState::ChartLoaded => "chart-loaded",
            MoverState::HintsLoaded => "hints-loaded",
            MoverState::ImagesLoaded => "images-loaded",
            MoverState::ChangesComputed => "changes-computed",
            MoverState::Moved => "moved",
            MoverState::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// One image of the move plan.
#[derive(Clone)]
pub struct ImageChange {
    pub template: ImageTemplate,
    pub original: ImageReference,
    pub image: Arc<dyn Image>,
    pub digest: String,
    /// Tag of the original reference, if any
    pub tag: Option<String>,
    pub rewritten: ImageReference,
    /// Target already holds the image, or an earlier change pushes it
    pub already_pushed: bool,
}

impl ImageChange {
    /// Reference to push to. Digest-pinned rewrites keep the original tag
    /// so the target registry records a readable name.
    pub fn push_reference(&self) -> ImageReference {
        match (&self.rewritten.tag, &self.rewritten.digest, &self.tag) {
            (None, Some(_), Some(tag)) => ImageReference {
                registry: self.rewritten.registry.clone(),
                repository: self.rewritten.repository.clone(),
                tag: Some(tag.clone()),
                digest: None,
            },
            _ => self.rewritten.clone(),
        }
    }
}

/// A value rewrite and the chart whose values file receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartChange {
    pub chart: String,
    pub action: RewriteAction,
}

/// Relocates a chart and its images.
pub struct ChartMover {
    request: ChartMoveRequest,
    config: MoverConfig,
    state: MoverState,
    chart: Chart,
    hints: Hints,
    changes: Vec<ImageChange>,
    actions: Vec<RewriteAction>,
    output: Option<PathBuf>,
    target: Arc<dyn ContainerRegistry>,
    _scratch: TempDir,
}

impl ChartMover {
    /// Prepare a move using registry clients built from the request credentials.
    pub async fn new(request: ChartMoveRequest, config: MoverConfig) -> Result<Self> {
        request.validate()?;
        let source: Arc<dyn ContainerRegistry> = Arc::new(RegistryClient::new(
            RegistryAuth::new(request.source.containers_auth.clone()),
            config.insecure,
        ));
        let target: Arc<dyn ContainerRegistry> = Arc::new(RegistryClient::new(
            RegistryAuth::new(request.target.containers_auth.clone()),
            config.insecure,
        ));
        Self::with_registries(request, config, source, target).await
    }

    /// Prepare a move against the given source and target registries.
    pub async fn with_registries(
        request: ChartMoveRequest,
        config: MoverConfig,
        source: Arc<dyn ContainerRegistry>,
        target: Arc<dyn ContainerRegistry>,
    ) -> Result<Self> {
        request.validate()?;
        let mut state = MoverState::Uninitialized;
        let scratch = TempDir::new()?;

        // Chart
        let (chart, bundle) = match &request.source.chart {
            ChartSpec::Local { path } => (chart::load(path)?, None),
            ChartSpec::IntermediateBundle { path } => {
                let bundle = IntermediateBundle::new(path);
                bundle.ensure()?;
                let dir = scratch.path().join(CHART_DIR);
                bundle.extract_dir(CHART_DIR, &dir)?;
                let chart = chart::load(&dir).map_err(|e| MoverError::ChartLoad {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                (chart, Some(bundle))
            }
        };
        let output = match &request.target.chart {
            ChartSpec::Local { path } => {
                let template = path.to_str().ok_or_else(|| {
                    MoverError::InvalidRequest(format!(
                        "output template {} is not valid UTF-8",
                        path.display()
                    ))
                })?;
                Some(chart::output_path(template, &chart)?)
            }
            ChartSpec::IntermediateBundle { .. } => None,
        };
        transition(&mut state, MoverState::ChartLoaded);

        // Hints
        let hints = load_hints(
            request.source.image_hints_file.as_deref(),
            &chart,
            bundle.as_ref(),
        )?;
        let templates = hints.templates()?;
        tracing::debug!(origin = %hints.origin, templates = templates.len(), "Loaded image hints");
        transition(&mut state, MoverState::HintsLoaded);

        // Images
        let (images_source, cache): (Arc<dyn ContainerRegistry>, Option<LayerCache>) = match &bundle {
            Some(bundle) => {
                let images_tar = scratch.path().join(IMAGES_ENTRY);
                bundle.extract_file(IMAGES_ENTRY, &images_tar)?;
                let tarball: Arc<dyn ContainerRegistry> = Arc::new(ImageTarball::open(images_tar));
                (tarball, None)
            }
            None => (source, Some(LayerCache::new(&config.cache_dir)?)),
        };
        let values = chart.merged_values()?;
        let loaded =
            load_images(images_source.as_ref(), cache.as_ref(), &templates, &values).await?;
        transition(&mut state, MoverState::ImagesLoaded);

        // Changes
        let mut changes = Vec::with_capacity(loaded.len());
        let mut actions: Vec<RewriteAction> = Vec::new();
        if request.target.chart.is_bundle() {
            for image in loaded {
                changes.push(ImageChange {
                    tag: image.original.tag.clone(),
                    rewritten: image.original.clone(),
                    template: image.template,
                    original: image.original,
                    image: image.image,
                    digest: image.digest,
                    already_pushed: true,
                });
            }
        } else {
            let rules = &request.target.rules;
            let mut pushes: HashSet<String> = HashSet::new();
            for image in loaded {
                let template_actions =
                    compute_rewrites(&image.template, &image.original, &image.digest, rules);
                let rewritten = image.template.render(&values, &template_actions)?;
                let mut change = ImageChange {
                    tag: image.original.tag.clone(),
                    template: image.template,
                    original: image.original,
                    image: image.image,
                    digest: image.digest,
                    rewritten,
                    already_pushed: false,
                };

                let push_ref = change.push_reference();
                change.already_pushed = if pushes.insert(push_ref.full_reference()) {
                    !target.check(&change.digest, &push_ref, rules.force_push).await?
                } else {
                    true
                };
                tracing::debug!(
                    original = %change.original,
                    rewritten = %change.rewritten,
                    push = !change.already_pushed,
                    "Computed image change"
                );

                for action in template_actions {
                    if !actions.contains(&action) {
                        actions.push(action);
                    }
                }
                changes.push(change);
            }
        }
        transition(&mut state, MoverState::ChangesComputed);

        Ok(Self {
            request,
            config,
            state,
            chart,
            hints,
            changes,
            actions,
            output,
            target,
            _scratch: scratch,
        })
    }

    pub fn state(&self) -> MoverState {
        self.state
    }

    pub fn chart(&self) -> &Chart {
        &self.chart
    }

    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    pub fn image_changes(&self) -> &[ImageChange] {
        &self.changes
    }

    pub fn rewrite_actions(&self) -> &[RewriteAction] {
        &self.actions
    }

    /// Rewrites grouped by the chart that receives them.
    pub fn chart_changes(&self) -> Result<Vec<ChartChange>> {
        self.actions
            .iter()
            .map(|action| {
                let destination = find_chart_destination(&self.chart, action)?;
                let chart = destination
                    .charts
                    .last()
                    .cloned()
                    .unwrap_or_else(|| self.chart.name().to_string());
                Ok(ChartChange {
                    chart,
                    action: destination.action,
                })
            })
            .collect()
    }

    /// Where the result will be written.
    pub fn destination(&self) -> &Path {
        match &self.output {
            Some(output) => output,
            None => self.request.target.chart.path(),
        }
    }

    /// Execute the move: write a bundle, or push images and repackage the
    /// rewritten chart. Returns the path written.
    pub async fn move_chart(&mut self) -> Result<PathBuf> {
        if self.state != MoverState::ChangesComputed {
            return Err(MoverError::InvalidRequest(format!(
                "cannot move from state {}",
                self.state
            )));
        }

        if let ChartSpec::IntermediateBundle { path } = &self.request.target.chart {
            let bundle = IntermediateBundle::new(path);
            bundle
                .write(&self.hints.raw, &self.chart, &self.distinct_originals())
                .await?;
            transition(&mut self.state, MoverState::Archived);
            return Ok(path.clone());
        }

        for change in self.changes.iter().filter(|c| !c.already_pushed) {
            let reference = change.push_reference();
            tracing::info!(
                source = %change.original,
                target = %reference,
                digest = %change.digest,
                "Pushing image"
            );
            push_with_retry(
                self.target.as_ref(),
                change.image.clone(),
                &reference,
                &self.config.retry,
            )
            .await?;
        }

        patch::apply(&mut self.chart, &self.actions)?;
        let output = self.destination().to_path_buf();
        chart::save_package(&self.chart, &output)?;
        transition(&mut self.state, MoverState::Moved);
        Ok(output)
    }

    fn distinct_originals(&self) -> Vec<(ImageReference, Arc<dyn Image>)> {
        let mut seen = HashSet::new();
        self.changes
            .iter()
            .filter(|c| seen.insert(c.original.full_reference()))
            .map(|c| (c.original.clone(), c.image.clone()))
            .collect()
    }
}

/// A template resolved against the source.
struct LoadedImage {
    template: ImageTemplate,
    original: ImageReference,
    image: Arc<dyn Image>,
    digest: String,
}

/// Render every template and pull each distinct reference once.
async fn load_images(
    source: &dyn ContainerRegistry,
    cache: Option<&LayerCache>,
    templates: &[ImageTemplate],
    values: &serde_yaml::Value,
) -> Result<Vec<LoadedImage>> {
    let mut resolved: HashMap<String, (Arc<dyn Image>, String)> = HashMap::new();
    let mut loaded = Vec::with_capacity(templates.len());

    for template in templates {
        let original = template.render(values, &[])?;
        let key = original.full_reference();
        let (image, digest) = match resolved.get(&key) {
            Some(found) => found.clone(),
            None => {
                tracing::debug!(reference = %original, template = %template, "Resolving image");
                let (image, digest) = source.pull(&original).await?;
                let image = match cache {
                    Some(cache) => cache.wrap(image),
                    None => image,
                };
                resolved.insert(key, (image.clone(), digest.clone()));
                (image, digest)
            }
        };
        loaded.push(LoadedImage {
            template: template.clone(),
            original,
            image,
            digest,
        });
    }
    Ok(loaded)
}

fn transition(state: &mut MoverState, next: MoverState) {
    tracing::debug!(from = %state, to = %next, "Mover state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::testing::write_tree;
    use crate::chart::ValuesTree;
    use crate::testutil::{FakeRegistry, MemoryImage};
    use relok_core::request::{ContainersAuth, OciImageLocation, Source, Target};
    use serde_yaml::Value;

    const HINTS: &str = "- \"{{ .image.registry }}/{{ .image.repository }}:{{ .image.tag }}\"\n- \"{{ .mariadb.image.registry }}/{{ .mariadb.image.repository }}:{{ .mariadb.image.tag }}\"\n";

    struct Fixture {
        dir: TempDir,
        source: Arc<FakeRegistry>,
        target: Arc<FakeRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            write_tree(
                &dir.path().join("wordpress"),
                &[
                    ("Chart.yaml", "apiVersion: v2\nname: wordpress\nversion: 1.0.0\ndependencies:\n- name: mariadb\n"),
                    ("values.yaml", "# frontend\nimage:\n  registry: docker.io\n  repository: bitnami/wordpress\n  tag: 1.2.3\n"),
                    ("Chart.lock", "dependencies: []\n"),
                    (".relok-images.yaml", HINTS),
                    ("charts/mariadb/Chart.yaml", "name: mariadb\nversion: 9.0.0\n"),
                    ("charts/mariadb/values.yaml", "image:\n  registry: docker.io\n  repository: bitnami/mariadb\n  tag: 10.5.8\n"),
                ],
            );
            let source = FakeRegistry::new();
            source.insert(&reference("docker.io/bitnami/wordpress:1.2.3"), MemoryImage::new("wordpress"));
            source.insert(&reference("docker.io/bitnami/mariadb:10.5.8"), MemoryImage::new("mariadb"));
            Self {
                dir,
                source,
                target: FakeRegistry::new(),
            }
        }

        fn chart_dir(&self) -> PathBuf {
            self.dir.path().join("wordpress")
        }

        fn out_template(&self) -> PathBuf {
            self.dir.path().join("out").join("%s-%s.relocated.tgz")
        }

        fn config(&self) -> MoverConfig {
            MoverConfig {
                cache_dir: self.dir.path().join("cache"),
                ..Default::default()
            }
        }

        async fn mover(&self, request: ChartMoveRequest) -> Result<ChartMover> {
            ChartMover::with_registries(
                request,
                self.config(),
                self.source.clone(),
                self.target.clone(),
            )
            .await
        }
    }

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    fn request(source: ChartSpec, target: ChartSpec, rules: OciImageLocation) -> ChartMoveRequest {
        ChartMoveRequest {
            source: Source {
                chart: source,
                image_hints_file: None,
                containers_auth: ContainersAuth::DefaultKeychain,
            },
            target: Target {
                chart: target,
                rules,
                containers_auth: ContainersAuth::DefaultKeychain,
            },
        }
    }

    fn registry_rule(registry: &str) -> OciImageLocation {
        OciImageLocation {
            registry: Some(registry.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_move_to_registry() {
        let fx = Fixture::new();
        let mut mover = fx
            .mover(request(
                ChartSpec::Local { path: fx.chart_dir() },
                ChartSpec::Local { path: fx.out_template() },
                registry_rule("harbor.local"),
            ))
            .await
            .unwrap();
        assert_eq!(mover.state(), MoverState::ChangesComputed);
        assert_eq!(mover.image_changes().len(), 2);
        assert!(mover.image_changes().iter().all(|c| !c.already_pushed));

        let chart_changes = mover.chart_changes().unwrap();
        assert_eq!(
            chart_changes,
            vec![
                ChartChange {
                    chart: "wordpress".to_string(),
                    action: RewriteAction::new(".image.registry", "harbor.local"),
                },
                ChartChange {
                    chart: "mariadb".to_string(),
                    action: RewriteAction::new(".image.registry", "harbor.local"),
                },
            ]
        );

        let output = mover.move_chart().await.unwrap();
        assert_eq!(mover.state(), MoverState::Moved);
        assert_eq!(output, fx.dir.path().join("out").join("wordpress-1.0.0.relocated.tgz"));

        let pushed = fx.target.get("harbor.local/bitnami/wordpress:1.2.3").unwrap();
        assert_eq!(pushed.digest(), MemoryImage::new("wordpress").digest());
        assert!(fx.target.get("harbor.local/bitnami/mariadb:10.5.8").is_some());

        let packaged = chart::load(&output).unwrap();
        let values: Value = serde_yaml::from_slice(packaged.values_bytes()).unwrap();
        assert_eq!(values["image"]["registry"], Value::from("harbor.local"));
        let mariadb: Value =
            serde_yaml::from_slice(packaged.dependencies()[0].values_bytes()).unwrap();
        assert_eq!(mariadb["image"]["registry"], Value::from("harbor.local"));
        assert!(packaged.lock_files().is_empty());
        assert!(packaged.metadata().get("dependencies").is_none());
    }

    #[tokio::test]
    async fn test_missing_rules_rejected() {
        let fx = Fixture::new();
        let result = fx
            .mover(request(
                ChartSpec::Local { path: fx.chart_dir() },
                ChartSpec::Local { path: fx.out_template() },
                OciImageLocation::default(),
            ))
            .await;
        assert!(matches!(result, Err(MoverError::MissingRewriteRules)));
        assert_eq!(fx.source.pulls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_references_pulled_once() {
        let fx = Fixture::new();
        let hints = fx.dir.path().join("hints.yaml");
        std::fs::write(
            &hints,
            "- \"{{ .image.registry }}/{{ .image.repository }}:{{ .image.tag }}\"\n- \"{{.image.registry}}/{{.image.repository}}:{{.image.tag}}\"\n",
        )
        .unwrap();
        let mut req = request(
            ChartSpec::Local { path: fx.chart_dir() },
            ChartSpec::Local { path: fx.out_template() },
            registry_rule("harbor.local"),
        );
        req.source.image_hints_file = Some(hints);

        let mut mover = fx.mover(req).await.unwrap();
        assert_eq!(fx.source.pulls(), 1);
        let changes = mover.image_changes();
        assert_eq!(changes.len(), 2);
        assert!(!changes[0].already_pushed);
        assert!(changes[1].already_pushed);
        assert_eq!(mover.rewrite_actions().len(), 1);

        mover.move_chart().await.unwrap();
        assert_eq!(fx.target.push_attempts(), 1);
    }

    #[tokio::test]
    async fn test_existing_target_skips_push() {
        let fx = Fixture::new();
        fx.target.insert(&reference("harbor.local/bitnami/wordpress:1.2.3"), MemoryImage::new("wordpress"));

        let mut mover = fx
            .mover(request(
                ChartSpec::Local { path: fx.chart_dir() },
                ChartSpec::Local { path: fx.out_template() },
                registry_rule("harbor.local"),
            ))
            .await
            .unwrap();
        let pending: Vec<_> = mover.image_changes().iter().filter(|c| !c.already_pushed).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].original.repository, "bitnami/mariadb");

        mover.move_chart().await.unwrap();
        assert_eq!(fx.target.push_attempts(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_target_digest() {
        let fx = Fixture::new();
        fx.target.insert(&reference("harbor.local/bitnami/wordpress:1.2.3"), MemoryImage::new("other"));
        let rules = registry_rule("harbor.local");

        let result = fx
            .mover(request(
                ChartSpec::Local { path: fx.chart_dir() },
                ChartSpec::Local { path: fx.out_template() },
                rules.clone(),
            ))
            .await;
        assert!(matches!(result, Err(MoverError::DigestMismatch { .. })));

        let forced = OciImageLocation {
            force_push: true,
            ..rules
        };
        let mover = fx
            .mover(request(
                ChartSpec::Local { path: fx.chart_dir() },
                ChartSpec::Local { path: fx.out_template() },
                forced,
            ))
            .await
            .unwrap();
        assert!(mover.image_changes().iter().all(|c| !c.already_pushed));
    }

    #[tokio::test]
    async fn test_push_failures_aggregated() {
        let fx = Fixture::new();
        let mut mover = fx
            .mover(request(
                ChartSpec::Local { path: fx.chart_dir() },
                ChartSpec::Local { path: fx.out_template() },
                registry_rule("harbor.local"),
            ))
            .await
            .unwrap();
        fx.target.fail_next_pushes(3);

        match mover.move_chart().await {
            Err(MoverError::PushFailed { errors, .. }) => assert_eq!(errors.len(), 3),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("move should fail"),
        }
        assert_eq!(mover.state(), MoverState::ChangesComputed);
    }

    #[tokio::test]
    async fn test_repository_prefix_pins_digest_for_combined_template() {
        let fx = Fixture::new();
        let chart_dir = fx.dir.path().join("ubuntu");
        write_tree(
            &chart_dir,
            &[
                ("Chart.yaml", "name: ubuntu\nversion: 0.1.0\n"),
                ("values.yaml", "image: ubuntu:latest\n"),
                (".relok-images.yaml", "- \"{{ .image }}\"\n"),
            ],
        );
        let ubuntu = MemoryImage::new("ubuntu");
        fx.source.insert(&reference("ubuntu:latest"), ubuntu.clone());

        let rules = OciImageLocation {
            repository_prefix: Some("my-company".to_string()),
            ..Default::default()
        };
        let mut mover = fx
            .mover(request(
                ChartSpec::Local { path: chart_dir },
                ChartSpec::Local { path: fx.out_template() },
                rules,
            ))
            .await
            .unwrap();
        assert_eq!(
            mover.rewrite_actions(),
            &[RewriteAction::new(
                ".image",
                format!("index.docker.io/my-company/ubuntu@{}", ubuntu.digest())
            )]
        );
        let change = &mover.image_changes()[0];
        assert_eq!(
            change.push_reference().full_reference(),
            "index.docker.io/my-company/ubuntu:latest"
        );

        mover.move_chart().await.unwrap();
        assert!(fx.target.get("my-company/ubuntu:latest").is_some());
    }

    #[tokio::test]
    async fn test_archive_and_replay() {
        let fx = Fixture::new();
        let bundle_path = fx.dir.path().join("wordpress.bundle.tar");

        let mut archiver = fx
            .mover(request(
                ChartSpec::Local { path: fx.chart_dir() },
                ChartSpec::IntermediateBundle { path: bundle_path.clone() },
                OciImageLocation::default(),
            ))
            .await
            .unwrap();
        assert!(archiver.rewrite_actions().is_empty());
        let written = archiver.move_chart().await.unwrap();
        assert_eq!(written, bundle_path);
        assert_eq!(archiver.state(), MoverState::Archived);
        assert!(IntermediateBundle::new(&bundle_path).is_intermediate_bundle());
        let pulls = fx.source.pulls();

        let mut replay = fx
            .mover(request(
                ChartSpec::IntermediateBundle { path: bundle_path.clone() },
                ChartSpec::Local { path: fx.out_template() },
                registry_rule("harbor.local"),
            ))
            .await
            .unwrap();
        assert_eq!(fx.source.pulls(), pulls);
        assert_eq!(replay.hints().raw, HINTS.as_bytes());

        let originals: Vec<(String, String)> = archiver
            .image_changes()
            .iter()
            .map(|c| (c.original.full_reference(), c.digest.clone()))
            .collect();
        let replayed: Vec<(String, String)> = replay
            .image_changes()
            .iter()
            .map(|c| (c.original.full_reference(), c.digest.clone()))
            .collect();
        assert_eq!(originals, replayed);

        replay.move_chart().await.unwrap();
        let pushed = fx.target.get("harbor.local/bitnami/mariadb:10.5.8").unwrap();
        assert_eq!(pushed.digest(), MemoryImage::new("mariadb").digest());
    }

    #[tokio::test]
    async fn test_bundle_source_rejects_hints_file() {
        let fx = Fixture::new();
        let bundle_path = fx.dir.path().join("wordpress.bundle.tar");
        fx.mover(request(
            ChartSpec::Local { path: fx.chart_dir() },
            ChartSpec::IntermediateBundle { path: bundle_path.clone() },
            OciImageLocation::default(),
        ))
        .await
        .unwrap()
        .move_chart()
        .await
        .unwrap();

        let mut req = request(
            ChartSpec::IntermediateBundle { path: bundle_path },
            ChartSpec::Local { path: fx.out_template() },
            registry_rule("harbor.local"),
        );
        req.source.image_hints_file = Some(fx.dir.path().join("hints.yaml"));
        assert!(matches!(fx.mover(req).await, Err(MoverError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_not_a_bundle() {
        let fx = Fixture::new();
        let fake = fx.dir.path().join("fake.tar");
        std::fs::write(&fake, b"garbage").unwrap();
        let result = fx
            .mover(request(
                ChartSpec::IntermediateBundle { path: fake },
                ChartSpec::Local { path: fx.out_template() },
                registry_rule("harbor.local"),
            ))
            .await;
        assert!(matches!(result, Err(MoverError::NotIntermediateBundle { .. })));
    }

    #[tokio::test]
    async fn test_missing_source_image_aborts() {
        let fx = Fixture::new();
        let empty = FakeRegistry::new();
        let result = ChartMover::with_registries(
            request(
                ChartSpec::Local { path: fx.chart_dir() },
                ChartSpec::Local { path: fx.out_template() },
                registry_rule("harbor.local"),
            ),
            fx.config(),
            empty,
            fx.target.clone(),
        )
        .await;
        assert!(matches!(result, Err(MoverError::Registry { .. })));
        assert_eq!(fx.target.push_attempts(), 0);
    }
}

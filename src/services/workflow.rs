use crate::core::catalog::{Story, StoryCatalog};
use crate::core::config::Config;
use crate::core::io::Storage;
use crate::services::image::{GenerationError, ImageGenerator};
use crate::services::prompt::{build_cover_prompt, build_segment_prompt};
use crate::services::seed::{cover_seed, segment_seed, SEED_SCHEME_VERSION};
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const NOT_IN_CATALOG: &str = "not in catalog";

/// Which outputs a run should produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionPolicy {
    All {
        #[serde(default)]
        covers: bool,
    },
    /// Only the given segment indices, keyed by story id.
    Listed { segments: BTreeMap<String, Vec<u32>> },
    Covers,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::All { covers: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Segment(u32),
    Cover,
}

/// One output artifact: a segment illustration or a story cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub story_id: String,
    pub kind: TargetKind,
}

impl Target {
    pub fn segment(story_id: &str, index: u32) -> Self {
        Self {
            story_id: story_id.to_string(),
            kind: TargetKind::Segment(index),
        }
    }

    pub fn cover(story_id: &str) -> Self {
        Self {
            story_id: story_id.to_string(),
            kind: TargetKind::Cover,
        }
    }

    pub fn file_name(&self) -> String {
        match self.kind {
            TargetKind::Segment(n) => format!("{}_seg{}.png", self.story_id, n),
            TargetKind::Cover => format!("{}_cover.png", self.story_id),
        }
    }

    pub fn output_path(&self, output_folder: &str) -> PathBuf {
        Path::new(output_folder).join(self.file_name())
    }

    pub fn seed(&self) -> u64 {
        match self.kind {
            TargetKind::Segment(n) => segment_seed(&self.story_id, n),
            TargetKind::Cover => cover_seed(&self.story_id),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Generated { seed: u64 },
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub target: Target,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub remote_calls: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.total - self.succeeded
    }

    fn record(&mut self, target: Target, status: ItemStatus) {
        self.total += 1;
        match &status {
            ItemStatus::Generated { .. } => self.succeeded += 1,
            ItemStatus::Skipped => {
                self.succeeded += 1;
                self.skipped += 1;
            }
            ItemStatus::Failed(_) => {}
        }
        self.outcomes.push(ItemOutcome { target, status });
    }

    pub fn summary(&self) -> String {
        format!("{}/{} succeeded", self.succeeded, self.total)
    }
}

/// Sequential, idempotent illustration driver over a story catalog.
pub struct BatchIllustrator {
    config: Config,
    catalog: StoryCatalog,
    generator: Box<dyn ImageGenerator>,
    storage: Arc<dyn Storage>,
}

impl BatchIllustrator {
    pub fn new(
        config: Config,
        catalog: StoryCatalog,
        generator: Box<dyn ImageGenerator>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            config,
            catalog,
            generator,
            storage,
        }
    }

    /// Targets in run order: stories in catalog order, segments ascending, cover last.
    pub fn plan(&self, policy: &SelectionPolicy) -> Vec<Target> {
        let mut targets = Vec::new();
        for story in self.catalog.stories() {
            match policy {
                SelectionPolicy::All { covers } => {
                    targets.extend(story.segments.iter().map(|s| Target::segment(&story.id, s.index)));
                    if *covers {
                        targets.push(Target::cover(&story.id));
                    }
                }
                SelectionPolicy::Listed { segments } => {
                    let Some(wanted) = segments.get(&story.id) else {
                        continue;
                    };
                    for segment in &story.segments {
                        if wanted.contains(&segment.index) {
                            targets.push(Target::segment(&story.id, segment.index));
                        }
                    }
                    for index in wanted {
                        if story.segment(*index).is_none() {
                            warn!("{} has no segment {}, ignoring", story.id, index);
                        }
                    }
                }
                SelectionPolicy::Covers => targets.push(Target::cover(&story.id)),
            }
        }
        if let SelectionPolicy::Listed { segments } = policy {
            for id in segments.keys() {
                if self.catalog.get(id).is_none() {
                    warn!("Unknown story id in selection: {}", id);
                }
            }
        }
        targets
    }

    /// An output counts as done when it exists and is larger than `min_file_size`.
    pub async fn is_satisfied(&self, path: &str) -> Result<bool> {
        Ok(matches!(self.storage.size(path).await?, Some(size) if size > self.config.min_file_size))
    }

    pub async fn run(&self, policy: &SelectionPolicy) -> Result<RunReport> {
        self.run_targets(self.plan(policy)).await
    }

    async fn run_targets(&self, targets: Vec<Target>) -> Result<RunReport> {
        let mut report = RunReport::default();
        info!(
            "Planned {} images into {} (seed scheme v{})",
            targets.len(),
            self.config.output_folder,
            SEED_SCHEME_VERSION
        );

        let pb = ProgressBar::new(targets.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        let delay = Duration::from_millis(self.config.request_delay_ms);
        let mut current_story: Option<&str> = None;

        for target in targets {
            let Some(story) = self.catalog.get(&target.story_id) else {
                warn!("{} is not in the catalog", target);
                report.record(target, ItemStatus::Failed(NOT_IN_CATALOG.to_string()));
                pb.inc(1);
                continue;
            };
            if current_story != Some(story.id.as_str()) {
                pb.println(format!("Story: {} ({})", story.title, story.id));
                current_story = Some(story.id.as_str());
            }
            pb.set_message(target.file_name());

            let path = target.output_path(&self.config.output_folder);
            let path_str = path.to_string_lossy().to_string();

            let satisfied = match self.is_satisfied(&path_str).await {
                Ok(satisfied) => satisfied,
                Err(e) => {
                    warn!("Could not inspect {}: {:#}", path_str, e);
                    false
                }
            };
            if satisfied {
                pb.println(format!("  [skip] {} already exists", target));
                report.record(target, ItemStatus::Skipped);
                pb.inc(1);
                continue;
            }

            let Some(prompt) = prompt_for(story, &target) else {
                warn!("{} is not in the catalog", target);
                report.record(target, ItemStatus::Failed(NOT_IN_CATALOG.to_string()));
                pb.inc(1);
                continue;
            };
            let status = match self.illustrate(&target, prompt, &path_str).await {
                Ok(seed) => {
                    pb.println(format!("  [ok]   {} (seed {})", target, seed));
                    ItemStatus::Generated { seed }
                }
                Err(e) => {
                    warn!("{} failed: {}", target, e);
                    pb.println(format!("  [fail] {}: {}", target, e));
                    ItemStatus::Failed(e.to_string())
                }
            };
            report.remote_calls += 1;
            report.record(target, status);
            pb.inc(1);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        pb.finish_with_message("done");
        info!("Finished: {}", report.summary());
        Ok(report)
    }

    /// Generates one target and writes it to `path`. Returns the seed the service used.
    async fn illustrate(
        &self,
        target: &Target,
        prompt: String,
        path: &str,
    ) -> Result<u64, GenerationError> {
        let mut request = self.generator.request_template();
        request.prompt = prompt;
        request.seed = target.seed();
        request.random_seed = false;
        debug!("{} prompt: {}", target, request.prompt);

        let result = self.generator.generate(&request).await?;
        let image = result.images.first().ok_or(GenerationError::EmptyResult)?;
        debug!("{} image at {} (seed {})", target, image.path, result.seed_label);

        let bytes = self.generator.fetch(image).await?;
        self.storage
            .write(path, &bytes)
            .await
            .map_err(|e| GenerationError::Copy(format!("{:#}", e)))?;
        Ok(result.seed)
    }
}

fn prompt_for(story: &Story, target: &Target) -> Option<String> {
    match target.kind {
        TargetKind::Segment(n) => story
            .segment(n)
            .map(|segment| build_segment_prompt(&segment.text, segment.role)),
        TargetKind::Cover => Some(build_cover_prompt(story)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{Segment, SpeakerRole};
    use crate::core::io::NativeStorage;
    use crate::services::image::{GenerationRequest, GenerationResult, ImageRef, Resolution};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;

    const IMAGE_SIZE: usize = 2048;

    struct MockGenerator {
        requests: Arc<Mutex<Vec<GenerationRequest>>>,
        fail_prompts_containing: Option<String>,
        empty: bool,
        missing_file: bool,
    }

    impl MockGenerator {
        fn new() -> (Self, Arc<Mutex<Vec<GenerationRequest>>>) {
            let requests = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    requests: requests.clone(),
                    fail_prompts_containing: None,
                    empty: false,
                    missing_file: false,
                },
                requests,
            )
        }
    }

    #[async_trait]
    impl ImageGenerator for MockGenerator {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GenerationResult, GenerationError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(needle) = &self.fail_prompts_containing {
                if request.prompt.contains(needle.as_str()) {
                    return Err(GenerationError::Remote("mock failure".to_string()));
                }
            }
            let scheme = if self.missing_file { "gone" } else { "mock" };
            let images = if self.empty {
                vec![]
            } else {
                vec![ImageRef {
                    path: format!("{}://{}", scheme, request.seed),
                    url: None,
                }]
            };
            Ok(GenerationResult {
                images,
                seed_label: request.seed.to_string(),
                seed: request.seed,
            })
        }

        async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, GenerationError> {
            if image.path.starts_with("mock://") {
                Ok(vec![1u8; IMAGE_SIZE])
            } else {
                Err(GenerationError::MissingFile(image.path.clone()))
            }
        }

        fn request_template(&self) -> GenerationRequest {
            GenerationRequest {
                prompt: String::new(),
                resolution: Resolution::new(1024, 1024),
                seed: 0,
                steps: 8,
                shift: 3.0,
                random_seed: false,
            }
        }
    }

    fn story(id: &str, texts: &[&str]) -> Story {
        Story {
            id: id.to_string(),
            title: format!("Title {}", id),
            category: None,
            protagonist: None,
            cover_prompt: None,
            segments: texts
                .iter()
                .zip(1u32..)
                .map(|(text, index)| Segment {
                    index,
                    text: text.to_string(),
                    role: SpeakerRole::Narrator,
                })
                .collect(),
        }
    }

    fn config(output: &Path) -> Config {
        Config {
            output_folder: output.to_string_lossy().to_string(),
            min_file_size: 1000,
            request_delay_ms: 0,
            ..Config::default()
        }
    }

    fn illustrator(
        output: &Path,
        stories: Vec<Story>,
        generator: MockGenerator,
    ) -> Result<BatchIllustrator> {
        Ok(BatchIllustrator::new(
            config(output),
            StoryCatalog::new(stories)?,
            Box::new(generator),
            Arc::new(NativeStorage::new()),
        ))
    }

    #[test]
    fn test_output_path_is_deterministic() {
        let seg = Target::segment("storyX", 2);
        assert_eq!(seg.output_path("out"), Path::new("out").join("storyX_seg2.png"));
        assert_eq!(seg.output_path("out"), Target::segment("storyX", 2).output_path("out"));
        assert_eq!(Target::cover("storyX").file_name(), "storyX_cover.png");
        assert_eq!(seg.seed(), segment_seed("storyX", 2));
        assert_eq!(Target::cover("storyX").seed(), cover_seed("storyX"));
    }

    #[tokio::test]
    async fn test_end_to_end_one_story_two_segments() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (generator, requests) = MockGenerator::new();
        let driver = illustrator(dir.path(), vec![story("storyX", &["one", "two"])], generator)?;

        let report = driver.run(&SelectionPolicy::default()).await?;

        assert_eq!(requests.lock().unwrap().len(), 2);
        assert!(dir.path().join("storyX_seg1.png").exists());
        assert!(dir.path().join("storyX_seg2.png").exists());
        assert_eq!(report.summary(), "2/2 succeeded");
        assert_eq!(report.remote_calls, 2);
        assert_eq!(report.failed(), 0);

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].seed, segment_seed("storyX", 1));
        assert_eq!(requests[1].seed, segment_seed("storyX", 2));
        assert!(requests.iter().all(|r| !r.random_seed));
        assert!(requests[0].prompt.contains("showing: one "));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stories = vec![story("a", &["x", "y"]), story("b", &["z"])];

        let (first, _) = MockGenerator::new();
        illustrator(dir.path(), stories.clone(), first)?
            .run(&SelectionPolicy::default())
            .await?;
        let before = fs::read(dir.path().join("a_seg1.png"))?;

        let (second, requests) = MockGenerator::new();
        let report = illustrator(dir.path(), stories, second)?
            .run(&SelectionPolicy::default())
            .await?;

        assert!(requests.lock().unwrap().is_empty());
        assert_eq!(report.skipped, 3);
        assert_eq!(report.summary(), "3/3 succeeded");
        assert_eq!(fs::read(dir.path().join("a_seg1.png"))?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_threshold() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // min_file_size is 1000: exactly 1000 bytes regenerates, 1001 skips.
        fs::write(dir.path().join("s_seg1.png"), vec![0u8; 1000])?;
        fs::write(dir.path().join("s_seg2.png"), vec![0u8; 1001])?;
        fs::write(dir.path().join("s_seg3.png"), b"")?;

        let (generator, requests) = MockGenerator::new();
        let driver = illustrator(dir.path(), vec![story("s", &["a", "b", "c"])], generator)?;
        let report = driver.run(&SelectionPolicy::default()).await?;

        let seeds: Vec<u64> = requests.lock().unwrap().iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![segment_seed("s", 1), segment_seed("s", 3)]);
        assert_eq!(report.skipped, 1);
        assert_eq!(fs::metadata(dir.path().join("s_seg1.png"))?.len(), IMAGE_SIZE as u64);
        assert_eq!(fs::metadata(dir.path().join("s_seg2.png"))?.len(), 1001);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_isolated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut generator, requests) = MockGenerator::new();
        generator.fail_prompts_containing = Some("BROKEN".to_string());

        let stories = vec![
            story("first", &["s1", "s2", "BROKEN", "s4", "s5"]),
            story("second", &["t1"]),
        ];
        let driver = illustrator(dir.path(), stories, generator)?;
        let report = driver.run(&SelectionPolicy::default()).await?;

        assert_eq!(requests.lock().unwrap().len(), 6);
        assert_eq!(report.total, 6);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.summary(), "5/6 succeeded");
        assert!(!dir.path().join("first_seg3.png").exists());
        assert!(dir.path().join("first_seg4.png").exists());
        assert!(dir.path().join("second_seg1.png").exists());

        let failed: Vec<&ItemOutcome> = report
            .outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Failed(_)))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].target, Target::segment("first", 3));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_result_counts_as_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut generator, _) = MockGenerator::new();
        generator.empty = true;

        let driver = illustrator(dir.path(), vec![story("e", &["only"])], generator)?;
        let report = driver.run(&SelectionPolicy::default()).await?;

        assert_eq!(report.summary(), "0/1 succeeded");
        assert_eq!(
            report.outcomes[0].status,
            ItemStatus::Failed(GenerationError::EmptyResult.to_string())
        );
        assert!(!dir.path().join("e_seg1.png").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_unresolvable_image_counts_as_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut generator, requests) = MockGenerator::new();
        generator.missing_file = true;

        let driver = illustrator(dir.path(), vec![story("m", &["only"])], generator)?;
        let report = driver.run(&SelectionPolicy::default()).await?;

        assert_eq!(requests.lock().unwrap().len(), 1);
        assert_eq!(report.summary(), "0/1 succeeded");
        assert_eq!(report.failed(), 1);
        match &report.outcomes[0].status {
            ItemStatus::Failed(reason) => assert!(reason.starts_with("image not found: ")),
            other => panic!("unexpected status {:?}", other),
        }
        assert!(!dir.path().join("m_seg1.png").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_failure_is_isolated_and_leaves_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // The output folder sits under a regular file, so nothing can be written there.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory")?;
        let output = blocker.join("images");

        let (generator, requests) = MockGenerator::new();
        let stories = vec![story("c", &["one", "two"]), story("d", &["three"])];
        let driver = illustrator(&output, stories, generator)?;
        let report = driver.run(&SelectionPolicy::default()).await?;

        assert_eq!(requests.lock().unwrap().len(), 3);
        assert_eq!(report.remote_calls, 3);
        assert_eq!(report.summary(), "0/3 succeeded");
        for outcome in &report.outcomes {
            match &outcome.status {
                ItemStatus::Failed(reason) => assert!(reason.starts_with("failed to save image: ")),
                other => panic!("unexpected status {:?}", other),
            }
        }

        assert!(blocker.is_file());
        let leftovers: Vec<_> = fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".png") || name.ends_with(".png.part"))
            .collect();
        assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
        Ok(())
    }

    #[tokio::test]
    async fn test_target_missing_from_catalog_is_counted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (generator, requests) = MockGenerator::new();
        let driver = illustrator(dir.path(), vec![story("a", &["1"])], generator)?;

        let targets = vec![
            Target::segment("a", 1),
            Target::segment("a", 7),
            Target::cover("ghost"),
        ];
        let report = driver.run_targets(targets).await?;

        assert_eq!(requests.lock().unwrap().len(), 1);
        assert_eq!(report.summary(), "1/3 succeeded");
        assert_eq!(report.remote_calls, 1);
        for outcome in &report.outcomes[1..] {
            assert_eq!(outcome.status, ItemStatus::Failed(NOT_IN_CATALOG.to_string()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_listed_selection() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (generator, requests) = MockGenerator::new();
        let stories = vec![story("a", &["1", "2", "3", "4"]), story("b", &["1", "2"])];
        let driver = illustrator(dir.path(), stories, generator)?;

        let mut segments = BTreeMap::new();
        segments.insert("a".to_string(), vec![4, 2, 9]);
        segments.insert("ghost".to_string(), vec![1]);
        let policy = SelectionPolicy::Listed { segments };

        assert_eq!(
            driver.plan(&policy),
            vec![Target::segment("a", 2), Target::segment("a", 4)]
        );

        let report = driver.run(&policy).await?;
        assert_eq!(report.summary(), "2/2 succeeded");
        assert_eq!(requests.lock().unwrap().len(), 2);
        assert!(!dir.path().join("a_seg1.png").exists());
        assert!(!dir.path().join("b_seg1.png").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cover_selection() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (generator, requests) = MockGenerator::new();
        let mut with_prompt = story("p", &["x"]);
        with_prompt.cover_prompt = Some("custom cover, no text".to_string());
        let driver = illustrator(dir.path(), vec![with_prompt, story("q", &["y"])], generator)?;

        let report = driver.run(&SelectionPolicy::Covers).await?;

        assert_eq!(report.summary(), "2/2 succeeded");
        assert!(dir.path().join("p_cover.png").exists());
        assert!(dir.path().join("q_cover.png").exists());
        assert!(!dir.path().join("p_seg1.png").exists());

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].prompt, "custom cover, no text");
        assert_eq!(requests[0].seed, cover_seed("p"));
        assert!(requests[1].prompt.contains("titled 'Title q'"));
        Ok(())
    }

    #[tokio::test]
    async fn test_all_with_covers_orders_cover_after_segments() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (generator, _) = MockGenerator::new();
        let driver = illustrator(dir.path(), vec![story("a", &["1", "2"])], generator)?;

        assert_eq!(
            driver.plan(&SelectionPolicy::All { covers: true }),
            vec![Target::segment("a", 1), Target::segment("a", 2), Target::cover("a")]
        );
        Ok(())
    }
}

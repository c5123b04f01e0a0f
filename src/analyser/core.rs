use super::containers::Resource;
use super::domain::{load_suffix_list, DomainResolver};
use super::filter::{label_resources, load_rules, AdblockEngine, FilterEngine};
use super::metrics::{aggregate, collect_data, AddressScope};
use super::party::attribute_resources;
use super::scan::scan_for_resources;
use super::utils::load_capture;
use crate::config::{Config, PreprocessConfig};
use crate::error::{Error, Result};
use crate::ui::output;
use publicsuffix::List;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared, read-only inputs of every study worker.
pub struct Settings<'a> {
    pub preprocess: &'a PreprocessConfig,
    pub suffixes: &'a List,
    pub scope: &'a AddressScope,
}

/// What one study folder produced.
#[derive(Debug)]
pub struct StudyOutcome {
    pub study: PathBuf,
    pub website: String,
    pub resources: Vec<Resource>,
}

impl StudyOutcome {
    /// The visit folder holding this study; snapshots are written per visit.
    pub fn visit(&self) -> PathBuf {
        self.study.parent().map(Path::to_path_buf).unwrap_or_default()
    }
}

/// The website a study was crawled for: the name of the study's grandparent folder
/// (`raw/<website>/<visit>/<study>`).
pub fn website_of(study: &Path) -> Option<String> {
    study
        .parent()?
        .parent()?
        .file_name()?
        .to_str()
        .map(String::from)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Non-hidden sub-directories of `path`, sorted.
fn list_dir(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && !dir_name(p).starts_with('.'))
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Study folders of one visit folder.
pub fn find_visit_studies(visit: &Path) -> Result<Vec<PathBuf>> {
    list_dir(visit)
}

/// Every study folder of the corpus: `<raw>/<website>/<visit>/<study>`.
pub fn find_studies(raw: &Path) -> Result<Vec<PathBuf>> {
    let mut studies = Vec::new();
    for website in list_dir(raw)? {
        for visit in list_dir(&website)? {
            studies.extend(list_dir(&visit)?);
        }
    }
    Ok(studies)
}

/// Runs the whole pipeline for one study.
///
/// Load, reconstruct, attribute, label, project. A study that cannot be loaded yields no
/// resources; it never takes other studies down with it.
pub fn preprocess_study(study: &Path, engine: &dyn FilterEngine, settings: &Settings) -> Vec<Resource> {
    let study_name = dir_name(study);
    let Some(website) = website_of(study) else {
        log::error!("Cannot tell the website of study {}", study.display());
        return Vec::new();
    };

    let capture_path = study.join(&settings.preprocess.capture);
    let mut capture = match load_capture(&capture_path) {
        Err(err) => {
            log::error!("No capture found at {}: {err}", capture_path.display());
            return Vec::new();
        }
        Ok(capture) => capture,
    };

    let scan = scan_for_resources(&capture, &website, &study_name, settings.scope);
    let mut resources = scan.resources;

    let domains = DomainResolver::new(settings.suffixes);
    attribute_resources(&mut resources, &scan.first_party, &website, &domains);
    label_resources(&mut resources, engine, &domains);
    collect_data(&mut resources, &capture, &settings.preprocess.collect, &settings.preprocess.cast);

    if settings.preprocess.keep_capture {
        mark_trackers(&mut capture, &resources);
        match output::data_as_json(&capture).map(|json| output::data_to_file(json, &capture_path)) {
            Ok(Ok(())) => log::info!("Keep capture at {}", capture_path.display()),
            Ok(Err(err)) => log::error!("Cannot rewrite capture {}: {err}", capture_path.display()),
            Err(err) => log::error!("Cannot serialize capture {}: {err}", capture_path.display()),
        }
    } else if let Err(err) = fs::remove_file(&capture_path) {
        log::warn!("Cannot remove capture {}: {err}", capture_path.display());
    }

    resources
}

/// Flags every frame carried by a tracker resource with `"is_tracker": true`.
pub fn mark_trackers(capture: &mut [Value], resources: &[Resource]) {
    for resource in resources.iter().filter(|r| r.is_tracker) {
        for &frame_nr in &resource.packets {
            // Frame numbers start at 1.
            let record = usize::try_from(frame_nr)
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|idx| capture.get_mut(idx))
                .and_then(|p| p.as_object_mut());
            if let Some(record) = record {
                record.insert(String::from("is_tracker"), Value::Bool(true));
            }
        }
    }
}

/// Processes study folders in parallel and writes the per-visit snapshots.
///
/// Returns one outcome per study in input order.
pub fn analyse(config: &Config, studies: &[PathBuf], jobs: Option<usize>) -> Result<Vec<StudyOutcome>> {
    log::info!("Starting analysis of {} studies.", studies.len());

    let rules = load_rules(&config.preprocess.filterlists)?;
    let suffixes = load_suffix_list(&config.preprocess.public_suffix_list)?;
    let scope = AddressScope::new(config.preprocess.internal_prefixes.clone());
    let settings = Settings {
        preprocess: &config.preprocess,
        suffixes: &suffixes,
        scope: &scope,
    };

    let outcomes = run_studies(studies, &settings, jobs, || AdblockEngine::new(&rules))?;

    if config.preprocess.keep_resource {
        write_snapshots(&outcomes, &config.preprocess.resources)?;
    }

    Ok(outcomes)
}

/// Runs `preprocess_study` over `studies` on a pool of `jobs` threads.
///
/// Each pool thread builds one engine with `build_engine` and then pulls studies off a
/// shared counter until none are left. A thread whose engine cannot be built takes no
/// studies. A study that panics, or that no thread picked up, yields no resources.
pub fn run_studies<E, F>(
    studies: &[PathBuf],
    settings: &Settings,
    jobs: Option<usize>,
    build_engine: F,
) -> Result<Vec<StudyOutcome>>
where
    E: FilterEngine,
    F: Fn() -> Result<E> + Sync,
{
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(jobs) = jobs {
        builder = builder.num_threads(jobs);
    }
    let pool = builder.build()?;

    let next = AtomicUsize::new(0);
    let done = pool.broadcast(|ctx| {
        let engine = match build_engine() {
            Ok(engine) => engine,
            Err(err) => {
                log::error!("Worker {} has no filter engine: {err}", ctx.index());
                return Vec::new();
            }
        };

        let mut done = Vec::new();
        loop {
            let idx = next.fetch_add(1, Ordering::Relaxed);
            let Some(study) = studies.get(idx) else {
                break;
            };
            done.push((idx, guarded_study(study, &engine, settings)));
        }
        done
    });

    let mut results: Vec<Option<Vec<Resource>>> = vec![None; studies.len()];
    for (idx, resources) in done.into_iter().flatten() {
        results[idx] = Some(resources);
    }

    Ok(studies
        .iter()
        .zip(results)
        .map(|(study, resources)| StudyOutcome {
            study: study.clone(),
            website: website_of(study).unwrap_or_default(),
            resources: resources.unwrap_or_else(|| {
                log::error!("Study {} was not processed", study.display());
                Vec::new()
            }),
        })
        .collect())
}

/// `preprocess_study` with panics contained to the study.
fn guarded_study(study: &Path, engine: &dyn FilterEngine, settings: &Settings) -> Vec<Resource> {
    match panic::catch_unwind(AssertUnwindSafe(|| preprocess_study(study, engine, settings))) {
        Ok(resources) => resources,
        Err(_) => {
            log::error!("Study {} aborted, its resources are dropped", study.display());
            Vec::new()
        }
    }
}

/// Writes the resources of each visit folder to `<visit>/<file_name>`.
pub fn write_snapshots(outcomes: &[StudyOutcome], file_name: &str) -> Result<()> {
    let mut visits: BTreeMap<PathBuf, Vec<&Resource>> = BTreeMap::new();
    for outcome in outcomes {
        visits
            .entry(outcome.visit())
            .or_default()
            .extend(outcome.resources.iter());
    }

    for (visit, resources) in visits {
        let path = visit.join(file_name);
        log::debug!("resources at {}", path.display());
        output::data_to_file(output::data_as_json(&resources)?, &path)?;
    }
    Ok(())
}

/// Aggregates all resources of the run into the corpus table. Returns the row count.
pub fn write_table(outcomes: &[StudyOutcome], config: &Config) -> Result<usize> {
    let resources: Vec<Resource> = outcomes.iter().flat_map(|o| o.resources.iter().cloned()).collect();
    let scope = AddressScope::new(config.preprocess.internal_prefixes.clone());
    let rows = aggregate(&resources, &scope);

    let path = config.table_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let written = output::write_table(&rows, &path)?;
    log::info!("Saved {written} resources at {}", path.display());
    Ok(written)
}

/// Studies selected by the command line: one visit folder, or the whole corpus.
pub fn select_studies(config: &Config, visit: Option<&Path>) -> Result<Vec<PathBuf>> {
    match visit {
        Some(visit) => find_visit_studies(visit),
        None => {
            let raw = config.raw_dir();
            if !raw.is_dir() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no corpus at {}", raw.display()),
                )));
            }
            log::info!("Reading from {}", raw.display());
            find_studies(&raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::domain::tests::test_list;
    use crate::analyser::filter::tests::StubEngine;
    use crate::analyser::filter::FilterMatch;
    use crate::analyser::scan::tests::{h2_data, h2_request, h2_response};

    fn study_dir(root: &Path, name: &str) -> PathBuf {
        let study = root.join("raw").join("example.com").join("2024-01-01").join(name);
        fs::create_dir_all(&study).unwrap();
        study
    }

    fn write_capture(study: &Path, capture: &[Value]) {
        fs::write(study.join("capture.json"), serde_json::to_string(capture).unwrap()).unwrap();
    }

    /// Blows up on any url containing "boom".
    struct FragileEngine;

    impl FilterEngine for FragileEngine {
        fn classify(&self, url: &str, _hostname: &str, _first_party: &str, _request_type: &str) -> FilterMatch {
            if url.contains("boom") {
                panic!("cannot classify {url}");
            }
            FilterMatch::default()
        }
    }

    #[test]
    fn test_website_of() {
        let study = Path::new("/data/raw/example.com/visit/study-1");
        assert_eq!(website_of(study).as_deref(), Some("example.com"));
        assert_eq!(website_of(Path::new("study")), None);
    }

    #[test]
    fn test_preprocess_study() {
        let dir = tempfile::tempdir().unwrap();
        let study = study_dir(dir.path(), "study-1");
        let capture = vec![
            h2_request(1, 1, "example.com", "/"),
            h2_response(2, 1, "200", &[("content-type", "text/html")]),
            h2_request(3, 3, "px.tracker.net", "/p.gif"),
            h2_response(4, 3, "200", &[("content-type", "image/gif")]),
            h2_data(5, 3, true),
        ];
        fs::write(study.join("capture.json"), serde_json::to_string(&capture).unwrap()).unwrap();

        let list = test_list();
        let preprocess = PreprocessConfig::default();
        let scope = AddressScope::new(vec![String::from("172.17.")]);
        let settings = Settings {
            preprocess: &preprocess,
            suffixes: &list,
            scope: &scope,
        };
        let engine = StubEngine {
            needles: vec!["tracker.net"],
            ..Default::default()
        };

        let resources = preprocess_study(&study, &engine, &settings);
        assert_eq!(resources.len(), 2);

        let tracker = resources.iter().find(|r| r.is_tracker).unwrap();
        assert!(tracker.is_tp);
        assert_eq!(tracker.study_name, "study-1");
        assert_eq!(tracker.website_call, "example.com");
        assert_eq!(tracker.context.as_deref(), Some("example.com"));
        assert_eq!(tracker.collected("sizes").unwrap().len(), tracker.packets.len());

        // The capture is rewritten with tracker frames flagged.
        let rewritten: Vec<Value> =
            serde_json::from_str(&fs::read_to_string(study.join("capture.json")).unwrap()).unwrap();
        assert_eq!(rewritten[4]["is_tracker"], Value::Bool(true));
        assert!(rewritten[0].get("is_tracker").is_none());
    }

    #[test]
    fn test_missing_capture_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let study = study_dir(dir.path(), "study-1");

        let list = test_list();
        let preprocess = PreprocessConfig::default();
        let scope = AddressScope::new(vec![]);
        let settings = Settings {
            preprocess: &preprocess,
            suffixes: &list,
            scope: &scope,
        };

        let resources = preprocess_study(&study, &StubEngine::default(), &settings);
        assert!(resources.is_empty());
    }

    #[test]
    fn test_panicking_study_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let page = vec![h2_request(1, 1, "example.com", "/"), h2_response(2, 1, "200", &[])];
        let boom = vec![h2_request(1, 1, "example.com", "/"), h2_request(2, 3, "boom.net", "/x.js")];
        let studies = vec![
            study_dir(dir.path(), "study-1"),
            study_dir(dir.path(), "study-2"),
            study_dir(dir.path(), "study-3"),
        ];
        write_capture(&studies[0], &page);
        write_capture(&studies[1], &boom);
        write_capture(&studies[2], &page);

        let list = test_list();
        let preprocess = PreprocessConfig::default();
        let scope = AddressScope::new(vec![String::from("172.17.")]);
        let settings = Settings {
            preprocess: &preprocess,
            suffixes: &list,
            scope: &scope,
        };

        let outcomes = run_studies(&studies, &settings, Some(2), || Ok(FragileEngine)).unwrap();
        let counts: Vec<usize> = outcomes.iter().map(|o| o.resources.len()).collect();
        assert_eq!(counts, vec![1, 0, 1]);
        assert_eq!(outcomes[1].study, studies[1]);
    }

    #[test]
    fn test_no_engine_yields_empty_studies() {
        let dir = tempfile::tempdir().unwrap();
        let study = study_dir(dir.path(), "study-1");
        write_capture(&study, &[h2_request(1, 1, "example.com", "/")]);

        let list = test_list();
        let preprocess = PreprocessConfig::default();
        let scope = AddressScope::new(vec![]);
        let settings = Settings {
            preprocess: &preprocess,
            suffixes: &list,
            scope: &scope,
        };

        let outcomes = run_studies(&[study], &settings, Some(2), || {
            Err::<FragileEngine, _>(Error::FilterList(String::from("unusable list")))
        })
        .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].resources.is_empty());
        assert_eq!(outcomes[0].website, "example.com");
    }

    #[test]
    fn test_find_studies_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        for study in ["a.com/v1/s1", "a.com/v1/s2", "b.com/v1/s1", "b.com/.git/s1", "a.com/v1/.tmp"] {
            fs::create_dir_all(raw.join(study)).unwrap();
        }

        let studies = find_studies(&raw).unwrap();
        let names: Vec<String> = studies
            .iter()
            .map(|s| s.strip_prefix(&raw).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(names, vec!["a.com/v1/s1", "a.com/v1/s2", "b.com/v1/s1"]);
    }
}

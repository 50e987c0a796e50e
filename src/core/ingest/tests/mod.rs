
use std::sync::Arc;

use crate::core::clock::ManualClock;
use crate::core::github::fake::{self, FakePlatform};
use crate::core::github::Workflow;
use crate::core::ingest::RunIngestor;
use crate::core::ingest::paths::{ArtifactKind, blob_path};
use crate::core::store::{MemoryObjectStore, ObjectStore};

const REPO: &str = "Contoso/Widgets";
const STARTED: &str = "2024-03-01T10:00:00Z";

struct Harness {
    platform: Arc<FakePlatform>,
    store: Arc<MemoryObjectStore>,
    ingestor: RunIngestor,
}

fn harness() -> Harness {
    harness_with_store(Arc::new(MemoryObjectStore::new()))
}

fn harness_with_store(store: Arc<MemoryObjectStore>) -> Harness {
    let platform = Arc::new(FakePlatform::new());
    let clock = Arc::new(ManualClock::new("2024-03-02T08:00:00Z".parse().unwrap()));
    platform.add_workflow(Workflow {
        id: 7,
        name: "CI Pipeline".to_string(),
        path: Some(".github/workflows/ci.yml".to_string()),
        state: Some("active".to_string()),
    });
    let ingestor = RunIngestor::new(platform.clone(), store.clone() as Arc<dyn ObjectStore>, clock);
    Harness {
        platform,
        store,
        ingestor,
    }
}

/// Two jobs, five steps, six log lines, every step excerpt present.
fn seed_attempt(platform: &FakePlatform, run_id: i64, attempt: u32) {
    platform.add_run(fake::run(REPO, run_id, attempt, STARTED));
    platform.set_jobs(
        run_id,
        attempt,
        vec![
            fake::job(
                run_id * 10 + 1,
                run_id,
                "build",
                "runner-1",
                &[(1, "Set up job", "success"), (2, "Checkout", "success"), (3, "Build", "success")],
            ),
            fake::job(
                run_id * 10 + 2,
                run_id,
                "test",
                "runner-2",
                &[(1, "Set up job", "success"), (2, "Run tests", "success")],
            ),
        ],
    );
    platform.set_archive(
        run_id,
        attempt,
        fake::log_zip(&[
            (
                "0_build.txt",
                "2024-03-01T10:00:01.0000000Z Preparing runner\n\
                 2024-03-01T10:00:02.0000000Z Syncing repository\n\
                 2024-03-01T10:00:03.0000000Z cargo build --release\n\
                 Finished release profile\n",
            ),
            ("build/1_Set up job.txt", "2024-03-01T10:00:01.0000000Z Preparing runner\n"),
            ("build/2_Checkout.txt", "2024-03-01T10:00:02.0000000Z Syncing repository\n"),
            (
                "build/3_Build.txt",
                "2024-03-01T10:00:03.0000000Z cargo build --release\nFinished release profile\n",
            ),
            (
                "1_test.txt",
                "2024-03-01T10:01:01.0000000Z Preparing runner\n\
                 2024-03-01T10:01:02.0000000Z test result: ok. 12 passed\n",
            ),
            ("test/1_Set up job.txt", "2024-03-01T10:01:01.0000000Z Preparing runner\n"),
            ("test/2_Run tests.txt", "2024-03-01T10:01:02.0000000Z test result: ok. 12 passed\n"),
        ]),
    );
}

fn path(kind: ArtifactKind, run_id: i64, attempt: u32) -> String {
    blob_path(kind, REPO, STARTED.parse().unwrap(), run_id, attempt)
}

fn rows(store: &MemoryObjectStore, path: &str) -> Vec<serde_json::Value> {
    let blob = store
        .blob(path)
        .unwrap_or_else(|| panic!("missing blob {}", path));
    std::str::from_utf8(&blob)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

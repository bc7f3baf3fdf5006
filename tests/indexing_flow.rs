//! End-to-end indexing flows against a sandbox of session directories and a
//! scripted stand-in for the indexing tool.
#![cfg(unix)]

use workspace_indexer::audit::{AuditAction, MemoryAuditSink};
use workspace_indexer::indexer::{FailureReason, IndexPhase, IndexResultStatus, WorkspaceLocks};
use workspace_indexer::{
    DenyReason, Error, IndexRequest, IndexStatus, IndexerConfig, IndexingService,
    IsolationDecision, PathError, SandboxSessionStore, ToolConfig,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    sandbox: tempfile::TempDir,
    tools: tempfile::TempDir,
    audit: Arc<MemoryAuditSink>,
    service: Arc<IndexingService>,
}

impl Harness {
    /// Sandbox with sessions `s1`, `s2`, `w1`, `w2`. The fake tool logs
    /// `<session dir> <args>` per call, `init` creates the marker and
    /// `index` runs `index_body`.
    fn new(index_body: &str) -> Self {
        let sandbox = tempfile::tempdir().expect("sandbox");
        let tools = tempfile::tempdir().expect("tools");
        for session in ["s1", "s2", "w1", "w2"] {
            std::fs::create_dir(sandbox.path().join(session)).expect("session dir");
        }
        std::fs::write(sandbox.path().join("s2/secret.txt"), "s2 only").expect("secret");

        let script = tools.path().join("indexing-tool.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$(basename \"$(pwd -P)\") $*\" >> '{log}'\ncase \"$1\" in\n  init) mkdir -p .mcp-vector-search && echo initialized ;;\n  index) {index_body} ;;\nesac\n",
                log = tools.path().join("calls.log").display(),
            ),
        )
        .expect("script");

        let config = IndexerConfig {
            workspace_root: sandbox.path().to_path_buf(),
            index_timeout: Duration::from_secs(1),
            min_index_timeout: Duration::from_millis(200),
            tool: ToolConfig {
                program: "/bin/sh".into(),
                args: vec![script.display().to_string()],
                marker_dir: ".mcp-vector-search".into(),
            },
            ..IndexerConfig::default()
        };

        let audit = Arc::new(MemoryAuditSink::new());
        let service = IndexingService::new(
            config,
            Arc::new(SandboxSessionStore::new(sandbox.path())),
            audit.clone(),
        )
        .expect("service");

        Self {
            sandbox,
            tools,
            audit,
            service: Arc::new(service),
        }
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.tools.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn workspace(&self, session: &str) -> PathBuf {
        self.sandbox.path().join(session)
    }

    /// Locks are keyed on the canonical workspace directory.
    fn lock_key(&self, session: &str) -> PathBuf {
        self.workspace(session).canonicalize().expect("canonical workspace")
    }
}

async fn wait_until_held(locks: &WorkspaceLocks, workspace: &Path) {
    for _ in 0..500 {
        if locks.holder(workspace).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workspace {} was never locked", workspace.display());
}

#[tokio::test]
async fn uninitialized_workspace_indexes_to_completion() {
    let harness = Harness::new("echo 'indexed 3 files'");
    assert_eq!(
        harness.service.status_of("w1").await.unwrap(),
        IndexStatus::NotIndexed
    );

    let result = harness
        .service
        .index_workspace("w1", IndexRequest::default())
        .await
        .expect("index w1");

    assert_eq!(result.status, IndexResultStatus::Completed);
    assert_eq!(harness.calls(), vec!["w1 init --force", "w1 index --force"]);
    assert!(harness.workspace("w1").join(".mcp-vector-search").is_dir());
    assert_eq!(
        harness.service.status_of("w1").await.unwrap(),
        IndexStatus::Indexed
    );

    let summary = serde_json::to_value(result.summary("w1")).unwrap();
    assert_eq!(summary["success"], true);
    assert_eq!(summary["stdout"], "indexed 3 files\n");
}

#[tokio::test]
async fn slow_index_phase_times_out() {
    let harness = Harness::new("sleep 30");

    let started = std::time::Instant::now();
    let result = harness
        .service
        .index_workspace("w2", IndexRequest::default())
        .await
        .expect("index w2");

    assert_eq!(result.status, IndexResultStatus::Failed);
    assert_eq!(result.failed_phase, Some(IndexPhase::Index));
    assert_eq!(result.failure_reason, Some(FailureReason::TimedOut));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(harness.service.locks().holder(&harness.lock_key("w2")).is_none());
    assert_eq!(
        harness.audit.actions(),
        vec![
            AuditAction::IndexStart,
            AuditAction::SubprocessComplete,
            AuditAction::SubprocessTimeout,
            AuditAction::IndexFailed,
        ]
    );
}

#[tokio::test]
async fn sibling_workspace_is_unreachable() {
    let harness = Harness::new("true");

    let decision = harness.service.check_path("s1", "../s2/secret.txt").await;
    assert_eq!(
        decision,
        IsolationDecision::Deny(DenyReason::Path(PathError::Traversal {
            path: "../s2/secret.txt".into()
        }))
    );

    let absolute = harness.workspace("s2").join("secret.txt");
    let decision = harness
        .service
        .check_path("s1", &absolute.display().to_string())
        .await;
    match decision {
        IsolationDecision::Deny(reason) => assert_eq!(reason.code(), "PATH_OUTSIDE_WORKSPACE"),
        IsolationDecision::Allow(path) => panic!("s1 reached {}", path.as_path().display()),
    }

    assert!(harness.service.check_path("s2", "secret.txt").await.is_allowed());
}

#[tokio::test]
async fn concurrent_requests_on_one_workspace_yield_one_busy() {
    let harness = Harness::new("sleep 1; echo done");

    let service = harness.service.clone();
    let first = tokio::spawn(async move {
        service
            .index_workspace("w1", IndexRequest::default().with_timeout_secs(10))
            .await
    });
    wait_until_held(harness.service.locks(), &harness.lock_key("w1")).await;

    let second = harness
        .service
        .index_workspace("w1", IndexRequest::default())
        .await;
    assert!(matches!(second, Err(Error::Busy(ref busy)) if busy.workspace == harness.lock_key("w1")));
    assert_eq!(second.unwrap_err().code(), "INDEXING_BUSY");

    let first = first.await.expect("join").expect("first request");
    assert!(first.is_completed());
    // The refused request never reached the tool.
    assert_eq!(harness.calls(), vec!["w1 init --force", "w1 index --force"]);
    assert_eq!(
        harness
            .audit
            .actions()
            .iter()
            .filter(|action| **action == AuditAction::FailedRequest)
            .count(),
        1
    );

    // Free again once the first request finished.
    let again = harness
        .service
        .index_workspace("w1", IndexRequest::default().with_timeout_secs(10))
        .await
        .expect("third request");
    assert!(again.is_completed());
}

#[tokio::test]
async fn different_workspaces_index_in_parallel() {
    let harness = Harness::new("sleep 2; echo done");
    let request = IndexRequest::default().with_timeout_secs(10);

    let started = std::time::Instant::now();
    let (w1, w2) = tokio::join!(
        harness.service.index_workspace("w1", request),
        harness.service.index_workspace("w2", request),
    );

    assert!(w1.expect("w1").is_completed());
    assert!(w2.expect("w2").is_completed());
    assert!(started.elapsed() < Duration::from_millis(3500));

    let mut calls = harness.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            "w1 index --force",
            "w1 init --force",
            "w2 index --force",
            "w2 init --force"
        ]
    );
}

#[tokio::test]
async fn services_sharing_a_lock_table_exclude_each_other() {
    let harness = Harness::new("sleep 1");
    let locks = harness.service.locks().clone();

    let other = IndexingService::new(
        harness.service.config().clone(),
        Arc::new(SandboxSessionStore::new(harness.sandbox.path())),
        Arc::new(MemoryAuditSink::new()),
    )
    .expect("second service")
    .with_locks(locks);

    let service = harness.service.clone();
    let first = tokio::spawn(async move {
        service
            .index_workspace("w1", IndexRequest::default().with_timeout_secs(10))
            .await
    });
    wait_until_held(harness.service.locks(), &harness.lock_key("w1")).await;

    let refused = other.index_workspace("w1", IndexRequest::default()).await;
    assert!(matches!(refused, Err(Error::Busy(_))));
    assert!(first.await.expect("join").is_ok());
}

#[tokio::test]
async fn reindex_without_force_skips_init() {
    let harness = Harness::new("echo done");
    let request = IndexRequest {
        force: false,
        timeout: None,
    };

    harness
        .service
        .index_workspace("w1", request)
        .await
        .expect("first run");
    let second = harness
        .service
        .index_workspace("w1", request)
        .await
        .expect("second run");

    assert!(second.is_completed());
    assert!(!second.init.spawned);
    assert_eq!(harness.calls(), vec!["w1 init", "w1 index", "w1 index"]);
}

#[tokio::test]
async fn failed_init_is_retried_on_next_request() {
    let harness = Harness::new("echo done");
    // Make the marker path a file so `mkdir -p` fails.
    let marker = harness.workspace("w1").join(".mcp-vector-search");
    std::fs::write(&marker, "").unwrap();

    let request = IndexRequest {
        force: false,
        timeout: None,
    };
    let first = harness
        .service
        .index_workspace("w1", request)
        .await
        .expect("first run");
    assert_eq!(first.failed_phase, Some(IndexPhase::Init));
    assert!(first.index.is_none());

    std::fs::remove_file(&marker).unwrap();
    let second = harness
        .service
        .index_workspace("w1", request)
        .await
        .expect("second run");
    assert!(second.is_completed());
    assert_eq!(harness.calls(), vec!["w1 init", "w1 init", "w1 index"]);
}

#[tokio::test]
async fn unknown_session_is_denied_without_spawning() {
    let harness = Harness::new("echo done");

    for session in ["ghost", "../w1", ".hidden"] {
        let error = harness
            .service
            .index_workspace(session, IndexRequest::default())
            .await
            .unwrap_err();
        assert!(
            matches!(error, Error::Denied(DenyReason::SessionNotFound)),
            "{session}: {error}"
        );
    }
    assert!(harness.calls().is_empty());
    assert!(!Path::new(&harness.workspace("w1")).join(".mcp-vector-search").exists());
}

#[tokio::test]
async fn symlink_out_of_the_sandbox_is_not_a_session() {
    let harness = Harness::new("echo done");
    let outside = tempfile::tempdir().expect("outside");
    std::fs::write(outside.path().join("secret.txt"), "not yours").expect("secret");
    std::os::unix::fs::symlink(outside.path(), harness.workspace("evil")).expect("symlink");

    assert_eq!(
        harness.service.check_path("evil", "secret.txt").await,
        IsolationDecision::Deny(DenyReason::SessionNotFound)
    );
    assert!(matches!(
        harness.service.status_of("evil").await,
        Err(Error::Denied(DenyReason::SessionNotFound))
    ));
    assert!(
        harness
            .service
            .index_workspace("evil", IndexRequest::default())
            .await
            .is_err()
    );
    assert!(harness.calls().is_empty());
    assert!(!outside.path().join(".mcp-vector-search").exists());
}

#[tokio::test]
async fn alias_of_another_session_cannot_index_it() {
    let harness = Harness::new("sleep 1; echo done");
    std::os::unix::fs::symlink(harness.workspace("w1"), harness.workspace("w3")).expect("symlink");

    let service = harness.service.clone();
    let first = tokio::spawn(async move {
        service
            .index_workspace("w1", IndexRequest::default().with_timeout_secs(10))
            .await
    });
    wait_until_held(harness.service.locks(), &harness.lock_key("w1")).await;

    let aliased = harness
        .service
        .index_workspace("w3", IndexRequest::default().with_timeout_secs(10))
        .await;
    assert!(matches!(aliased, Err(Error::Denied(_))), "{aliased:?}");
    assert!(!harness.service.check_path("w3", "notes.md").await.is_allowed());

    assert!(first.await.expect("join").expect("w1").is_completed());
    // Only the real session ever reached the tool.
    assert_eq!(harness.calls(), vec!["w1 init --force", "w1 index --force"]);
}

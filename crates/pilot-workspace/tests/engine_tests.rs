use pilot_workspace::{
    PatchEngine, PatchEngineError, PopulateOptions, Retention, WorkspaceStore,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::path::{Path, PathBuf};

async fn workspace_with(files: &[(&str, &str)]) -> (tempfile::TempDir, WorkspaceStore) {
    let project = tempfile::tempdir().unwrap();
    for (path, content) in files {
        let full = project.path().join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(full, content).await.unwrap();
    }
    let base = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::create(base.path(), "run", Retention::Keep)
        .await
        .unwrap();
    store
        .populate(project.path(), &PopulateOptions::unfiltered())
        .await
        .unwrap();
    (base, store)
}

fn numbered(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("line {i}")).collect()
}

#[tokio::test]
async fn two_hunk_modify_on_twenty_line_file() {
    let original = numbered(20).join("\n") + "\n";
    let (_base, store) = workspace_with(&[("src/list.txt", original.as_str())]).await;

    let diff = "\
--- a/src/list.txt
+++ b/src/list.txt
@@ -3,3 +3,4 @@
 line 3
 line 4
+inserted A
 line 5
@@ -15,3 +16,4 @@
 line 15
+inserted B
 line 16
 line 17
";
    let mut engine = PatchEngine::new(&store);
    let result = engine.apply_diff(diff).await.unwrap();

    assert!(result.success);
    assert_eq!(result.files.len(), 1);

    let mut expected = numbered(20);
    expected.insert(15, "inserted B".to_string());
    expected.insert(4, "inserted A".to_string());
    let content = store.read_to_string("src/list.txt").await.unwrap();
    assert_eq!(content.lines().count(), 22);
    assert_eq!(content, expected.join("\n") + "\n");
}

#[tokio::test]
async fn create_on_existing_path_fails_and_leaves_file() {
    let (_base, store) = workspace_with(&[("exists.txt", "keep me\n")]).await;
    let diff = "--- /dev/null\n+++ b/exists.txt\n@@ -0,0 +1 @@\n+replacement\n";

    let mut engine = PatchEngine::new(&store);
    let result = engine.apply_diff(diff).await.unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("already exists"));
    assert_eq!(store.read_to_string("exists.txt").await.unwrap(), "keep me\n");
}

#[tokio::test]
async fn failure_mid_patch_restores_every_file() {
    let (_base, store) = workspace_with(&[
        ("a.txt", "alpha\nbeta\n"),
        ("b.txt", "to be deleted\n"),
        ("c.txt", "gamma\ndelta\n"),
    ])
    .await;
    let before = store.snapshot().await.unwrap();

    let diff = "\
--- a/a.txt
+++ b/a.txt
@@ -1,2 +1,2 @@
 alpha
-beta
+BETA
--- a/b.txt
+++ /dev/null
@@ -1 +0,0 @@
-to be deleted
--- /dev/null
+++ b/new/dir/x.txt
@@ -0,0 +1,2 @@
+x1
+x2
--- a/c.txt
+++ b/c.txt
@@ -1,2 +1,2 @@
 gamma
-not delta
+DELTA
";
    let mut engine = PatchEngine::new(&store);
    let result = engine.apply_diff(diff).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.files.len(), 4);
    assert!(result.files[..3].iter().all(|f| f.success && f.rolled_back));
    assert!(!result.files[3].success);
    assert!(result.error.as_deref().unwrap().contains("context mismatch"));
    assert!(result.rollback.as_ref().unwrap().is_clean());
    assert!(result.touched_paths().is_empty());

    assert_eq!(store.snapshot().await.unwrap(), before);
    assert!(!store.root().join("new").exists());
    assert!(engine.pending().is_empty());
}

#[tokio::test]
async fn rollback_round_trip_per_operation() {
    let (_base, store) = workspace_with(&[("m.txt", "one\n"), ("d.txt", "gone\n")]).await;
    let before = store.snapshot().await.unwrap();

    let diff = "\
--- a/m.txt
+++ b/m.txt
@@ -1 +1 @@
-one
+uno
--- a/d.txt
+++ /dev/null
@@ -1 +0,0 @@
-gone
--- /dev/null
+++ b/c.txt
@@ -0,0 +1 @@
+created
";
    let mut engine = PatchEngine::new(&store);
    let result = engine.apply_diff(diff).await.unwrap();
    assert!(result.success);
    assert_eq!(
        result.touched_paths(),
        vec![PathBuf::from("m.txt"), PathBuf::from("d.txt"), PathBuf::from("c.txt")]
    );
    assert_eq!(store.read_to_string("m.txt").await.unwrap(), "uno\n");
    assert!(!store.root().join("d.txt").exists());
    assert_eq!(store.read_to_string("c.txt").await.unwrap(), "created");

    let report = engine.rollback().await;
    assert_eq!(report.restored, 3);
    assert_eq!(store.snapshot().await.unwrap(), before);
    assert!(!store.root().join("c.txt").exists());
}

#[tokio::test]
async fn commit_clears_undo_log() {
    let (_base, store) = workspace_with(&[("f.txt", "a\n")]).await;
    let mut engine = PatchEngine::new(&store);
    engine
        .apply_diff("--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-a\n+b\n")
        .await
        .unwrap();

    assert_eq!(engine.commit(), 1);
    let report = engine.rollback().await;
    assert_eq!(report.restored, 0);
    assert_eq!(store.read_to_string("f.txt").await.unwrap(), "b\n");
}

#[tokio::test]
async fn escaping_path_is_rejected() {
    let (base, store) = workspace_with(&[("f.txt", "a\n")]).await;
    let diff = "--- /dev/null\n+++ b/../escape.txt\n@@ -0,0 +1 @@\n+x\n";

    let mut engine = PatchEngine::new(&store);
    let result = engine.apply_diff(diff).await.unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("invalid patch path"));
    assert!(!base.path().join("escape.txt").exists());
}

#[tokio::test]
async fn modify_missing_file_is_not_found() {
    let (_base, store) = workspace_with(&[("f.txt", "a\n")]).await;
    let diff = "--- a/missing.txt\n+++ b/missing.txt\n@@ -1 +1 @@\n-a\n+b\n";

    let mut engine = PatchEngine::new(&store);
    let result = engine.apply_diff(diff).await.unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("file not found"));
}

#[tokio::test]
async fn io_error_is_wrapped_after_rollback() {
    let (_base, store) = workspace_with(&[("f.txt", "a\n"), ("dir/inner.txt", "x")]).await;
    let before = store.snapshot().await.unwrap();
    // Reading a directory as a file fails with something other than NotFound.
    let diff = "\
--- a/f.txt
+++ b/f.txt
@@ -1 +1 @@
-a
+b
--- a/dir
+++ b/dir
@@ -1 +1 @@
-x
+y
";
    let mut engine = PatchEngine::new(&store);
    let err = engine.apply_diff(diff).await.unwrap_err();

    assert!(matches!(err, PatchEngineError::Io { ref path, .. } if path.ends_with("dir")));
    assert_eq!(store.snapshot().await.unwrap(), before);
}

#[tokio::test]
async fn unparsable_diff_touches_nothing() {
    let (_base, store) = workspace_with(&[("f.txt", "a\n")]).await;
    let mut engine = PatchEngine::new(&store);
    let err = engine.apply_diff("no diff here").await.unwrap_err();
    assert!(matches!(err, PatchEngineError::Parse(_)));
    assert!(engine.pending().is_empty());
}

fn replace_line_diff(path: &Path, index: usize, old: &str, new: &str) -> String {
    let p = path.display();
    format!(
        "--- a/{p}\n+++ b/{p}\n@@ -{n},1 +{n},1 @@\n-{old}\n+{new}\n",
        n = index + 1
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn apply_then_rollback_restores_content(
        lines in prop::collection::vec("[a-z ]{0,12}", 1..30),
        pick in any::<prop::sample::Index>(),
        replacement in "[A-Z]{1,12}",
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let original = lines.join("\n") + "\n";
            let (_base, store) = workspace_with(&[("p.txt", original.as_str())]).await;
            let index = pick.index(lines.len());
            let diff = replace_line_diff(Path::new("p.txt"), index, &lines[index], &replacement);

            let mut engine = PatchEngine::new(&store);
            let result = engine.apply_diff(&diff).await.unwrap();
            prop_assert!(result.success);

            let mut expected = lines.clone();
            expected[index] = replacement.clone();
            prop_assert_eq!(
                store.read_to_string("p.txt").await.unwrap(),
                expected.join("\n") + "\n"
            );

            engine.rollback().await;
            prop_assert_eq!(store.read_to_string("p.txt").await.unwrap(), original);
            Ok(())
        })?;
    }
}

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

fn write_fake_restic(bin_path: &Path) {
    let script = r#"#!/usr/bin/env bash
set -euo pipefail
state="${FAKE_RESTIC_STATE:?}"

case "${1:-}" in
  backup)
    id="${FAKE_RESTIC_SNAPSHOT:-abc123def4567890}"
    echo '{"message_type":"status","percent_done":1}'
    echo "{\"message_type\":\"summary\",\"snapshot_id\":\"${id}\"}"
    echo "${id}" >> "${state}"
    ;;
  check)
    if [[ "${FAKE_RESTIC_CHECK_FAIL:-0}" == "1" ]]; then
      echo "error: pack 5f2c damaged" >&2
      exit 1
    fi
    echo "no errors were found"
    ;;
  snapshots)
    printf '['
    sep=""
    if [[ -f "${state}" ]]; then
      while read -r id; do
        printf '%s{"id":"%s","short_id":"%s","paths":[],"tags":["deepfreeze"]}' "${sep}" "${id}" "${id:0:8}"
        sep=","
      done < "${state}"
    fi
    printf ']\n'
    ;;
  restore)
    target="$4"
    include="$6"
    mkdir -p "${target}${include}"
    echo restored > "${target}${include}/RESTORED"
    ;;
  *)
    exit 2
    ;;
esac
"#;
    fs::write(bin_path, script).expect("write fake restic");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(bin_path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(bin_path, perms).expect("chmod");
    }
}

struct Sandbox {
    _tmp: TempDir,
    base: PathBuf,
    home: PathBuf,
    mounts: PathBuf,
    restic: PathBuf,
    state: PathBuf,
}

impl Sandbox {
    /// Scratch installation with one local volume per name.
    fn new(volumes: &[&str]) -> Self {
        let tmp = tempdir().expect("tempdir");
        let base = fs::canonicalize(tmp.path()).expect("canonicalize");
        let mut table = String::new();
        for name in volumes {
            let vol = base.join(name);
            fs::create_dir_all(&vol).expect("mkdir volume");
            table.push_str(&format!("/dev/{name} {} ext4 rw 0 0\n", vol.display()));
        }
        let mounts = base.join("mounts");
        fs::write(&mounts, table).expect("write mounts");
        let restic = base.join("restic");
        write_fake_restic(&restic);
        Self {
            home: base.join("home"),
            state: base.join("restic-snapshots"),
            _tmp: tmp,
            base,
            mounts,
            restic,
        }
    }

    fn volume(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    fn folder(&self, volume: &str, name: &str) -> PathBuf {
        let folder = self.volume(volume).join(name);
        fs::create_dir_all(&folder).expect("mkdir folder");
        fs::write(folder.join("a.txt"), "hello").expect("write a");
        fs::write(folder.join("b.txt"), "world").expect("write b");
        folder
    }

    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("deepfreeze");
        cmd.current_dir(&self.base)
            .env("HOME", &self.base)
            .env("DEEPFREEZE_HOME", &self.home)
            .env("DEEPFREEZE_MOUNTS_FILE", &self.mounts)
            .env("DEEPFREEZE_ENGINE_BIN", &self.restic)
            .env("FAKE_RESTIC_STATE", &self.state)
            .env_remove("DEEPFREEZE_LOG")
            .env_remove("RUST_LOG");
        cmd
    }

    fn shard(&self, volume: &str) -> Value {
        let path = self
            .volume(volume)
            .join(".deepfreeze-staging/ledger.json");
        let raw = fs::read_to_string(&path).expect("read shard");
        serde_json::from_str(&raw).expect("parse shard")
    }
}

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json report")
}

#[test]
fn stage_then_archive_deletes_after_verification() {
    let sb = Sandbox::new(&["vol"]);
    let folder = sb.folder("vol", "old-project");

    sb.cmd()
        .arg("stage")
        .arg(&folder)
        .args(["--note", "2019 client work"])
        .assert()
        .success();
    assert!(!folder.exists());
    let staged = sb
        .volume("vol")
        .join(".deepfreeze-staging/files/old-project");
    assert!(staged.join("a.txt").is_file());

    sb.cmd()
        .args(["archive", "--yes"])
        .assert()
        .success()
        .stdout(predicates::str::contains("archived root="));

    let shard = sb.shard("vol");
    let entry = &shard["archives"][0];
    assert_eq!(entry["status"], "archived_and_deleted");
    assert_eq!(entry["snapshot_ref"], "abc123def4567890");
    assert!(entry["deleted_at"].is_string());
    assert_eq!(entry["note"], "2019 client work");
    assert_eq!(shard["statistics"]["total_archived_bytes"], 10);
    assert!(!staged.exists());

    let events = fs::read_to_string(sb.home.join("logs/events.log")).expect("events log");
    assert!(events.contains("\"phase\":\"archive\""));
}

#[test]
fn failing_repository_check_keeps_files_and_marks_failed() {
    let sb = Sandbox::new(&["vol"]);
    let folder = sb.folder("vol", "photos");
    sb.cmd().arg("stage").arg(&folder).assert().success();

    sb.cmd()
        .args(["archive", "--yes"])
        .env("FAKE_RESTIC_CHECK_FAIL", "1")
        .assert()
        .failure()
        .stderr(predicates::str::contains("E005_VERIFICATION_FAILED"))
        .stderr(predicates::str::contains("safe to re-stage"));

    let shard = sb.shard("vol");
    let entry = &shard["archives"][0];
    assert_eq!(entry["status"], "failed");
    assert!(entry["snapshot_ref"].is_null());
    assert!(
        sb.volume("vol")
            .join(".deepfreeze-staging/files/photos/a.txt")
            .is_file()
    );

    sb.cmd().args(["retry", "--yes"]).assert().success();
    let shard = sb.shard("vol");
    assert_eq!(shard["archives"][0]["status"], "archived_and_deleted");
}

#[test]
fn verify_flags_reference_missing_from_repository() {
    let sb = Sandbox::new(&["vol"]);
    let folder = sb.folder("vol", "scans");
    sb.cmd().arg("stage").arg(&folder).assert().success();
    sb.cmd()
        .args(["archive", "--yes"])
        .env("FAKE_RESTIC_SNAPSHOT", "zzz0000011112222")
        .assert()
        .success();

    sb.cmd().arg("verify").assert().success();

    // The snapshot was pruned out from under the ledger.
    fs::write(&sb.state, "abc123def4567890\n").expect("rewrite remote state");
    let output = sb
        .cmd()
        .args(["--json", "verify"])
        .assert()
        .failure()
        .get_output()
        .clone();
    let report = json_stdout(&output);
    let issues = report["data"]["issues"].as_array().expect("issues");
    let dangling = issues
        .iter()
        .filter(|i| i["kind"] == "dangling_reference")
        .collect::<Vec<_>>();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0]["snapshot_ref"], "zzz0000011112222");
    assert!(issues.iter().any(|i| i["kind"] == "orphan_snapshot"));
    assert_eq!(report["data"]["passed"], false);
}

#[test]
fn status_sums_two_roots_with_sources() {
    let sb = Sandbox::new(&["vol_a", "vol_b"]);
    let a = sb.folder("vol_a", "one");
    let b = sb.folder("vol_b", "two");
    sb.cmd().arg("stage").arg(&a).arg(&b).assert().success();
    sb.cmd().args(["archive", "--yes", "--keep-local"]).assert().success();

    let output = sb
        .cmd()
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();
    let report = json_stdout(&output);
    let data = &report["data"];
    assert_eq!(data["statistics"]["total_items"], 2);
    assert_eq!(data["statistics"]["total_archived_bytes"], 20);
    let sources = data["_sources"].as_array().expect("sources");
    assert_eq!(sources.len(), 2);

    let roots = fs::read_to_string(sb.home.join("staging_roots.toml")).expect("registry");
    assert!(roots.contains("vol_a"));
    assert!(roots.contains("vol_b"));
}

#[test]
fn invalid_path_is_skipped_while_others_stage() {
    let sb = Sandbox::new(&["vol"]);
    let good = sb.folder("vol", "keep");
    sb.cmd()
        .arg("stage")
        .arg(sb.volume("vol").join("ghost"))
        .arg(&good)
        .assert()
        .failure()
        .stderr(predicates::str::contains("E001_INVALID_PATH"));

    assert!(!good.exists());
    let shard = sb.shard("vol");
    assert_eq!(shard["archives"].as_array().expect("archives").len(), 1);
}

#[test]
fn restore_pulls_archived_entry_into_target() {
    let sb = Sandbox::new(&["vol"]);
    let folder = sb.folder("vol", "taxes");
    sb.cmd().arg("stage").arg(&folder).assert().success();
    sb.cmd().args(["archive", "--yes"]).assert().success();

    let id = sb.shard("vol")["archives"][0]["id"]
        .as_str()
        .expect("id")
        .to_string();
    let target = sb.base.join("restored");
    sb.cmd()
        .args(["restore", &id, "--target"])
        .arg(&target)
        .assert()
        .success()
        .stdout(predicates::str::contains("restored_path="));

    let staged = sb
        .volume("vol")
        .join(".deepfreeze-staging/files/taxes");
    let restored = target.join(staged.strip_prefix("/").expect("absolute"));
    assert!(restored.join("RESTORED").is_file());
    assert_eq!(
        sb.shard("vol")["archives"][0]["status"],
        "archived_and_deleted"
    );
}

#[test]
fn list_filters_by_status() {
    let sb = Sandbox::new(&["vol"]);
    let folder = sb.folder("vol", "drafts");
    sb.cmd().arg("stage").arg(&folder).assert().success();

    sb.cmd()
        .args(["list", "--status", "staged"])
        .assert()
        .success()
        .stdout(predicates::str::contains(" staged "));
    sb.cmd()
        .args(["list", "--status", "archived"])
        .assert()
        .success()
        .stdout(predicates::str::contains("no entries"));
}

// kiln-core/tests/guise.rs
//
// End-to-end runs of the interpreter against a local formula directory. A
// shell script stands in for the Go toolchain: `go build -o=<out>` writes a
// `guise` that prints its help text and exits 1, like the real binary does.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_common::pipeline::{FormulaState, PipelineEvent};
use kiln_common::Config;
use kiln_core::{event_channel, uninstall, Session, UninstallOptions};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const FAKE_GO: &str = r#"#!/bin/sh
[ "$1" = "build" ] || { echo "go: unknown command $1" >&2; exit 2; }
out=""
ldflags=""
for arg in "$@"; do
  case "$arg" in
    -o=*) out="${arg#-o=}" ;;
    -ldflags=*) ldflags="${arg#-ldflags=}" ;;
  esac
done
[ -n "$out" ] || { echo "go: no output path" >&2; exit 2; }
[ "$ldflags" = "-s -w" ] || { echo "go: unexpected ldflags '$ldflags'" >&2; exit 3; }
mkdir -p "$(dirname "$out")"
cat > "$out" <<'EOF'
#!/bin/sh
echo "Guise - switch between git identities"
echo "Usage: guise <command>"
exit 1
EOF
chmod +x "$out"
"#;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    formulae: PathBuf,
    sources: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let formulae = dir.path().join("formulae");
        let sources = dir.path().join("sources");
        fs::create_dir_all(&formulae).unwrap();
        fs::create_dir_all(&sources).unwrap();
        Self {
            root,
            formulae,
            sources,
            _dir: dir,
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::with_root(&self.root);
        config.formula_dirs = vec![self.formulae.clone()];
        config.fetch_retries = 0;
        config
    }

    fn session(&self) -> Session {
        self.session_with_events().0
    }

    fn session_with_events(&self) -> (Session, broadcast::Receiver<PipelineEvent>) {
        let (tx, rx) = event_channel();
        let session = Session::for_config(self.config(), tx, CancellationToken::new()).unwrap();
        (session, rx)
    }

    /// Writes a gzipped tarball with every file under `top/` and returns its
    /// URL and digest.
    fn tarball(&self, name: &str, top: &str, files: &[(&str, &str, u32)]) -> (String, String) {
        let path = self.sources.join(name);
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (rel, body, mode) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{top}/{rel}"), body.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        let sha = hex::encode(Sha256::digest(fs::read(&path).unwrap()));
        (format!("file://{}", path.display()), sha)
    }

    fn write_formula(&self, name: &str, text: &str) {
        fs::write(self.formulae.join(format!("{name}.toml")), text).unwrap();
    }

    fn add_go(&self, install_script: &str) {
        let (url, sha) = self.tarball("go1.22.0.src.tar.gz", "go", &[("bin/go", FAKE_GO, 0o755)]);
        self.write_formula(
            "go",
            &format!(
                r#"
name = "go"
version = "1.22.0"
desc = "Open source programming language"
homepage = "https://go.dev/"
url = "{url}"
sha256 = "{sha}"
license = "BSD-3-Clause"
test = []

[[install]]
type = "shell"
script = "{install_script}"
"#
            ),
        );
    }

    fn add_guise(&self, sha_override: Option<&str>) {
        self.add_guise_expecting(sha_override, "Guise");
    }

    /// Like `add_guise`, with `expected` as the text the self-test looks for
    /// in the help output.
    fn add_guise_expecting(&self, sha_override: Option<&str>, expected: &str) {
        let (url, sha) = self.tarball(
            "guise-0.1.0.tar.gz",
            "guise-0.1.0",
            &[("main.go", "package main\n", 0o644), ("go.mod", "module guise\n", 0o644)],
        );
        let sha = sha_override.unwrap_or(&sha).to_string();
        self.write_formula(
            "guise",
            &format!(
                r#"
name = "guise"
desc = "Switch between multiple git identities"
homepage = "https://github.com/jagtesh/guise"
url = "{url}"
sha256 = "{sha}"
license = "BSD-3-Clause"

[[dependencies]]
name = "go"
kind = "build"

[flags]
ldflags = "-s -w"

[[install]]
type = "run"
program = "go"
args = ["build", "{{std_go_args}}"]

[[test]]
type = "assert_output"
program = "guise"
args = ["--help"]
status = 1
contains = "{expected}"
"#
            ),
        );
    }
}

const GO_INSTALL: &str = "mkdir -p {bin} && cp bin/go {bin}/go";

fn labels(states: &[FormulaState]) -> Vec<&'static str> {
    states.iter().map(FormulaState::label).collect()
}

fn entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|rd| rd.count()).unwrap_or(0)
}

#[tokio::test]
async fn installs_and_verifies_guise() {
    let fx = Fixture::new();
    fx.add_go(GO_INSTALL);
    fx.add_guise(None);
    let session = fx.session();
    let config = fx.config();

    let plan = session.plan(&["guise".to_string()]);
    assert_eq!(plan.order(), vec!["go", "guise"]);

    let report = session.install(&["guise".to_string()]).await;
    let guise = report.record("guise").unwrap();
    assert_eq!(
        labels(&guise.trace),
        vec!["Pending", "Resolved", "Fetched", "Built", "Installed", "Verified"],
        "{:?}",
        guise.error
    );
    assert_eq!(report.exit_code(), 0);

    let link = config.bin_dir().join("guise");
    assert_eq!(
        fs::read_link(&link).unwrap(),
        config.formula_keg_path("guise", "0.1.0").join("bin/guise")
    );
    assert!(config.formula_keg_path("go", "1.22.0").join("bin/go").is_file());
    assert_eq!(entries(&config.tmp_dir()), 0);
}

#[tokio::test]
async fn second_install_is_a_no_op() {
    let fx = Fixture::new();
    fx.add_go(GO_INSTALL);
    fx.add_guise(None);
    let config = fx.config();

    let first = fx.session().install(&["guise".to_string()]).await;
    assert_eq!(first.exit_code(), 0);
    let receipt_path = config.receipt_path("guise", "0.1.0");
    let before = fs::read(&receipt_path).unwrap();

    let second = fx.session().install(&["guise".to_string()]).await;
    assert_eq!(second.exit_code(), 0);
    assert_eq!(
        labels(&second.record("guise").unwrap().trace),
        vec!["Pending", "Resolved", "Installed"]
    );
    assert!(second.record("go").is_none());
    assert_eq!(fs::read(&receipt_path).unwrap(), before);

    // go is installed and requested, so it is planned and left alone.
    let both = fx.session().install(&["go".to_string(), "guise".to_string()]).await;
    for name in ["go", "guise"] {
        assert_eq!(
            labels(&both.record(name).unwrap().trace),
            vec!["Pending", "Resolved", "Installed"]
        );
    }
}

#[tokio::test]
async fn reinstall_does_not_rebuild_a_removed_build_tool() {
    let fx = Fixture::new();
    fx.add_go(GO_INSTALL);
    fx.add_guise(None);
    let config = fx.config();
    assert_eq!(fx.session().install(&["guise".to_string()]).await.exit_code(), 0);

    let removed = uninstall(&config, "go", UninstallOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(removed.removed_versions, vec!["1.22.0"]);
    assert!(!config.formula_keg_path("go", "1.22.0").exists());

    let session = fx.session();
    assert_eq!(session.plan(&["guise".to_string()]).order(), vec!["guise"]);
    let again = session.install(&["guise".to_string()]).await;
    assert_eq!(again.exit_code(), 0);
    assert_eq!(
        labels(&again.record("guise").unwrap().trace),
        vec!["Pending", "Resolved", "Installed"]
    );
    assert!(again.record("go").is_none());
    assert!(!config.formula_keg_path("go", "1.22.0").exists());
}

#[tokio::test]
async fn digest_mismatch_stops_before_building() {
    let fx = Fixture::new();
    fx.add_go(GO_INSTALL);
    fx.add_guise(Some(&"0".repeat(64)));
    let config = fx.config();

    let report = fx.session().install(&["guise".to_string()]).await;
    let guise = report.record("guise").unwrap();
    assert_eq!(labels(&guise.trace), vec!["Pending", "Resolved", "Failed"]);
    assert!(matches!(
        guise.state(),
        FormulaState::Failed { stage: kiln_common::Stage::Fetch, .. }
    ));
    assert!(matches!(guise.error, Some(kiln_common::KilnError::Integrity { .. })));
    assert_eq!(report.exit_code(), 4);
    assert_eq!(entries(&config.tmp_dir()), 0);
    assert!(!config.formula_cellar_dir("guise").exists());
}

#[tokio::test]
async fn corrupt_archive_fails_the_build() {
    let fx = Fixture::new();
    fx.add_go(GO_INSTALL);
    let junk = fx.sources.join("junk-1.0.tar.gz");
    fs::write(&junk, b"this is not a gzip stream at all").unwrap();
    let sha = hex::encode(Sha256::digest(fs::read(&junk).unwrap()));
    fx.write_formula(
        "junk",
        &format!(
            r#"
name = "junk"
version = "1.0"
desc = "Archive that does not unpack"
homepage = "https://example.com/"
url = "file://{}"
sha256 = "{sha}"
license = "MIT"
test = []

[[install]]
type = "shell"
script = "true"
"#,
            junk.display()
        ),
    );
    let config = fx.config();

    let report = fx.session().install(&["junk".to_string()]).await;
    let record = report.record("junk").unwrap();
    assert_eq!(labels(&record.trace), vec!["Pending", "Resolved", "Fetched", "Failed"]);
    assert!(matches!(
        record.state(),
        FormulaState::Failed { stage: kiln_common::Stage::Build, .. }
    ));
    assert_eq!(report.exit_code(), 5);
    assert_eq!(entries(&config.tmp_dir()), 0);
    assert!(!config.formula_cellar_dir("junk").exists());
}

#[tokio::test]
async fn failed_self_test_keeps_the_install() {
    let fx = Fixture::new();
    fx.add_go(GO_INSTALL);
    fx.add_guise_expecting(None, "Nope");
    let config = fx.config();

    let (session, mut rx) = fx.session_with_events();
    let report = session.install(&["guise".to_string()]).await;
    let guise = report.record("guise").unwrap();
    assert_eq!(
        labels(&guise.trace),
        vec!["Pending", "Resolved", "Fetched", "Built", "Installed", "Failed"]
    );
    assert!(guise.unverified());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.warnings().count(), 1);
    assert_eq!(
        fs::read_link(config.bin_dir().join("guise")).unwrap(),
        config.formula_keg_path("guise", "0.1.0").join("bin/guise")
    );

    let mut warned = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(PipelineEvent::VerificationWarning { formula, failures }) => {
                warned.push((formula, failures))
            }
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert_eq!(warned.len(), 1);
    assert_eq!(warned[0].0, "guise");
    assert!(warned[0].1.iter().any(|f| f.contains("Nope")), "{:?}", warned[0].1);
}

#[tokio::test]
async fn failed_dependency_skips_dependents() {
    let fx = Fixture::new();
    fx.add_go("echo 'cannot build go' >&2; exit 1");
    fx.add_guise(None);

    let report = fx.session().install(&["guise".to_string()]).await;
    let go = report.record("go").unwrap();
    match &go.error {
        Some(kiln_common::KilnError::Build { output, .. }) => {
            assert!(output.contains("cannot build go"))
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        report.record("guise").unwrap().state(),
        &FormulaState::Skipped {
            blocked_by: "go".to_string()
        }
    );
    assert_eq!(report.exit_code(), 5);
}

#[tokio::test]
async fn unknown_formula_is_a_resolution_failure() {
    let fx = Fixture::new();
    fx.add_guise(None);
    let report = fx.session().install(&["guise".to_string()]).await;
    assert!(matches!(
        report.record("guise").unwrap().error,
        Some(kiln_common::KilnError::UnknownDependency { ref missing, .. }) if missing == "go"
    ));
    assert_eq!(report.exit_code(), 3);
}

#[tokio::test]
async fn test_then_uninstall() {
    let fx = Fixture::new();
    fx.add_go(GO_INSTALL);
    fx.add_guise(None);
    let config = fx.config();
    assert_eq!(fx.session().install(&["guise".to_string()]).await.exit_code(), 0);

    let tested = fx.session().test(&["guise".to_string()]).await;
    assert_eq!(
        labels(&tested.record("guise").unwrap().trace),
        vec!["Pending", "Installed", "Verified"]
    );
    assert_eq!(tested.exit_code(), 0);

    // Replace the binary with one that lost its help text.
    let keg_bin = config.formula_keg_path("guise", "0.1.0").join("bin/guise");
    fs::write(&keg_bin, "#!/bin/sh\nexit 1\n").unwrap();
    let broken = fx.session().test(&["guise".to_string()]).await;
    assert_eq!(broken.exit_code(), 7);

    let report = uninstall(&config, "guise", UninstallOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.removed_versions, vec!["0.1.0"]);
    assert!(config.bin_dir().join("guise").symlink_metadata().is_err());
    let missing = fx.session().test(&["guise".to_string()]).await;
    assert!(matches!(
        missing.record("guise").unwrap().error,
        Some(kiln_common::KilnError::NotInstalled(_))
    ));
    assert_eq!(missing.exit_code(), 7);
}

// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use checkon_runner::{
    cache::WorkspaceCache,
    compare::{Comparator, ComparatorBuilder},
    config::CheckonConfig,
    env_filter::EnvironmentFilter,
    env_runner::EnvironmentRunner,
};
use color_eyre::eyre::Result;
use std::{fs, os::unix::fs::PermissionsExt};

pub(crate) const PROJECT_URL: &str = "https://example.com/org/widgets.git";
pub(crate) const MISSING_URL: &str = "https://example.com/org/missing.git";
pub(crate) const REVISION: &str = "0123456789abcdef0123456789abcdef01234567";

/// Stands in for `git`: cloning creates a near-empty directory, and every checkout is at
/// [`REVISION`]. URLs containing `missing` fail to clone.
const FAKE_GIT: &str = r#"#!/bin/sh
set -e
case "$1" in
    clone)
        # clone --quiet -- URL DEST
        case "$4" in
            *missing*)
                echo "fatal: repository '$4' not found" >&2
                exit 128
                ;;
        esac
        mkdir -p "$5"
        printf 'fixture\n' > "$5/README"
        ;;
    rev-parse)
        echo "@REVISION@"
        ;;
    *)
        echo "unexpected git command: $*" >&2
        exit 2
        ;;
esac
"#;

/// Stands in for tox. Environments `py37` and `py38` have tests `test_foo` and `test_bar`;
/// `test_foo` fails in `py38` when `widget==2.0` is installed.
const FAKE_TOX: &str = r#"#!/bin/sh
set -e
state="@STATE@"
case "$1" in
    --notest)
        # --notest -c CHECKOUT --result-json PATH
        echo setup >> "$state/setup-count"
        printf '{"toxversion": "3.24.0", "platform": "linux", "testenvs": {}}\n' > "$5"
        ;;
    -l)
        printf 'py37\npy38\n'
        ;;
    -e)
        # -e ENV --run-command COMMAND
        printf '%s\n' "$4" > ".installed-$2"
        ;;
    --result-json)
        # --result-json PATH -e ENV
        json="$2"
        env="$4"
        report=$(printf '%s' "$PYTEST_ADDOPTS" | sed -n 's/.*--junitxml=\([^ ]*\).*/\1/p' | tr -d "'")
        installed=$(cat ".installed-$env")
        failures=0
        failure=""
        case "$env:$installed" in
            py38:*widget==2.0*)
                failures=1
                failure='<failure message="assert 2 == 1">E   assert 2 == 1</failure>'
                ;;
        esac
        cat > "$report" <<XML
<?xml version="1.0" encoding="utf-8"?>
<testsuites>
<testsuite name="pytest" errors="0" failures="$failures" skipped="0" tests="2" time="0.100" timestamp="2021-03-04T05:06:07" hostname="ci">
<testcase classname="tests.test_widget" name="test_foo" file="tests/test_widget.py" line="3" time="0.050">$failure</testcase>
<testcase classname="tests.test_widget" name="test_bar" file="tests/test_widget.py" line="7" time="0.050"></testcase>
</testsuite>
</testsuites>
XML
        printf '{"toxversion": "3.24.0", "platform": "linux", "testenvs": {"%s": {"test": []}}}\n' "$env" > "$json"
        ;;
    *)
        echo "unexpected tox command: $*" >&2
        exit 2
        ;;
esac
"#;

/// A scratch directory holding fake tools, a config file and the cache.
pub(crate) struct Sandbox {
    dir: Utf8TempDir,
}

impl Sandbox {
    pub(crate) fn new() -> Result<Self> {
        let dir = camino_tempfile::Builder::new()
            .prefix("checkon-integration-")
            .tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("bin"))?;
        fs::create_dir_all(root.join("state"))?;

        let git = root.join("bin/git");
        write_script(&git, &FAKE_GIT.replace("@REVISION@", REVISION))?;
        let tox = root.join("bin/tox");
        write_script(
            &tox,
            &FAKE_TOX.replace("@STATE@", root.join("state").as_str()),
        )?;

        fs::write(
            root.join("checkon.toml"),
            format!(
                r#"
                [cache]
                dir = "cache"

                [git]
                program = "{git}"

                [tool]
                command = ["{tox}"]
                install-command = "pip install --force {{requirement}}"
                pytest-addopts = ""

                [run]
                env-jobs = 2
                "#
            ),
        )?;

        Ok(Self { dir })
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        self.dir.path()
    }

    pub(crate) fn config(&self) -> Result<CheckonConfig> {
        Ok(CheckonConfig::from_sources(self.root(), None)?)
    }

    pub(crate) fn comparator(
        &self,
        configure: impl FnOnce(&mut ComparatorBuilder),
    ) -> Result<Comparator> {
        let config = self.config()?;
        let cache_dir = config
            .cache_dir()
            .map(Utf8Path::to_owned)
            .unwrap_or_else(|| self.root().join("cache"));
        let cache = WorkspaceCache::new(cache_dir, config.git_program())?;
        let runner = EnvironmentRunner::new(
            config.tool().clone(),
            EnvironmentFilter::all(),
            config.env_jobs(),
        );
        let mut builder = ComparatorBuilder::default();
        builder
            .set_project_jobs(config.project_jobs())
            .set_exclude_unhealthy(config.exclude_unhealthy());
        configure(&mut builder);
        Ok(builder.build(cache, runner))
    }

    pub(crate) fn setup_count(&self) -> usize {
        fs::read_to_string(self.root().join("state/setup-count"))
            .map(|contents| contents.lines().count())
            .unwrap_or(0)
    }

    pub(crate) fn artifacts_dir(&self) -> Utf8PathBuf {
        self.root().join("artifacts")
    }
}

fn write_script(path: &Utf8Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

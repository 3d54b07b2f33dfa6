use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use crate::supervisor::BuildCommand;

/// Upper bound for any single wait in tests.
pub const WAIT: Duration = Duration::from_secs(10);

const BUILD_SCRIPT: &str = r#"
case "$1" in
  hello)
    echo "Hello, world!"
    echo "Hello from stderr" >&2
    ;;
  hang)
    echo "Too eepy to build.."
    sleep 60
    echo "Huh? Where was I?"
    ;;
  args)
    shift
    for arg in "$@"; do
      echo "$arg"
    done
    ;;
  blank)
    echo before
    echo
    echo after
    ;;
  partial)
    printf 'no newline'
    ;;
  fail)
    echo "failing on purpose" >&2
    exit 3
    ;;
  stubborn)
    trap '' TERM
    echo "Ignoring SIGTERM"
    sleep 1
    touch stubborn.done
    ;;
esac
"#;

const MAKEFILE: &str = "\
hello:
\t@echo \"Hello, world!\"
\t@echo \"Hello from stderr\" >&2

hang:
\t@echo \"Too eepy to build..\"
\t@sleep 60
\t@echo \"Huh? Where was I?\"

.PHONY: hello hang
";

/// A temporary build directory holding `build.sh` and a `Makefile`.
pub struct BuildDir {
    dir: TempDir,
}

impl BuildDir {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("build.sh"), BUILD_SCRIPT).unwrap();
        std::fs::write(dir.path().join("Makefile"), MAKEFILE).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Runs `sh build.sh <args>` inside the build directory.
pub fn script_command() -> BuildCommand {
    BuildCommand::new("sh").with_leading_args(["build.sh"])
}

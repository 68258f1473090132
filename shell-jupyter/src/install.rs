//! Kernel spec installation and notebook launch

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

const KERNEL_NAME: &str = "shell-jupyter";

/// Where `jupyter kernelspec install` puts the spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallScope {
    #[default]
    User,
    SysPrefix,
}

impl InstallScope {
    fn flag(self) -> &'static str {
        match self {
            InstallScope::User => "--user",
            InstallScope::SysPrefix => "--sys-prefix",
        }
    }
}

/// The interpreter command line and language recorded in the spec
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub scope: InstallScope,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub language: String,
}

/// The `kernel.json` contents
///
/// The argv reruns the installed binary with the same interpreter options,
/// so the spec keeps working after the build directory is gone.
pub fn kernel_spec(options: &InstallOptions) -> Value {
    let mut argv = vec![
        format!("{{resource_dir}}/{}", executable_name()),
        "--interpreter".to_string(),
        options.interpreter.clone(),
    ];
    for arg in &options.interpreter_args {
        // `=` keeps clap from reading a leading dash as a flag
        argv.push(format!("--interpreter-arg={}", arg));
    }
    argv.extend([
        "--language".to_string(),
        options.language.clone(),
        "-f".to_string(),
        "{connection_file}".to_string(),
    ]);

    json!({
        "argv": argv,
        "display_name": format!("{} ({})", options.language, options.interpreter),
        "language": options.language,
        // SIGINT shuts the kernel down, so interrupts must come as messages
        "interrupt_mode": "message",
        "env": {},
        "metadata": {
            "debugger": false
        }
    })
}

fn executable_name() -> &'static str {
    if cfg!(windows) {
        "shell-jupyter.exe"
    } else {
        "shell-jupyter"
    }
}

/// Write the executable and `kernel.json` into `dir`
pub fn write_spec_dir(dir: &Path, exe_path: &Path, options: &InstallOptions) -> Result<()> {
    fs::create_dir_all(dir).context("Failed to create kernel spec directory")?;

    let dest_exe = dir.join(executable_name());
    fs::copy(exe_path, &dest_exe).context("Failed to copy executable")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&dest_exe)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&dest_exe, perms)?;
    }

    fs::write(
        dir.join("kernel.json"),
        serde_json::to_string_pretty(&kernel_spec(options))?,
    )
    .context("Failed to write kernel.json")?;
    Ok(())
}

/// Install the kernel spec using `jupyter kernelspec install`
pub fn install_kernel(options: &InstallOptions) -> Result<()> {
    tracing::info!("Installing {} kernel spec", KERNEL_NAME);

    let temp_dir = env::temp_dir().join("shell-jupyter-kernel-install");
    if temp_dir.exists() {
        fs::remove_dir_all(&temp_dir).context("Failed to clean temporary directory")?;
    }

    let exe_path = env::current_exe().context("Failed to get current executable path")?;
    write_spec_dir(&temp_dir, &exe_path, options)?;

    let flag = options.scope.flag();
    tracing::info!(
        "Running: jupyter kernelspec install {} --name {} {}",
        temp_dir.display(),
        KERNEL_NAME,
        flag
    );

    let status = Command::new("jupyter")
        .arg("kernelspec")
        .arg("install")
        .arg(&temp_dir)
        .arg("--name")
        .arg(KERNEL_NAME)
        .arg(flag)
        .status()
        .context("Failed to execute 'jupyter kernelspec install'. Is Jupyter installed?")?;

    fs::remove_dir_all(&temp_dir).context("Failed to remove temporary directory")?;

    if !status.success() {
        anyhow::bail!("jupyter kernelspec install failed with status: {}", status);
    }

    println!("{} kernel installed successfully", KERNEL_NAME);
    println!("To verify installation, run:");
    println!("  jupyter kernelspec list");
    Ok(())
}

/// Start `jupyter notebook` and wait for it to exit
pub fn launch_notebook() -> Result<()> {
    tracing::info!("Launching jupyter notebook");
    let status = Command::new("jupyter")
        .arg("notebook")
        .status()
        .context("Failed to execute 'jupyter notebook'. Is Jupyter installed?")?;

    if !status.success() {
        anyhow::bail!("jupyter notebook exited with status: {}", status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> InstallOptions {
        InstallOptions {
            scope: InstallScope::User,
            interpreter: "bash".to_string(),
            interpreter_args: vec!["-s".to_string(), "--norc".to_string()],
            language: "bash".to_string(),
        }
    }

    #[test]
    fn test_kernel_spec_records_interpreter() {
        let spec = kernel_spec(&options());
        let argv: Vec<&str> = spec["argv"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();

        assert!(argv[0].starts_with("{resource_dir}/shell-jupyter"));
        assert_eq!(&argv[1..3], &["--interpreter", "bash"]);
        assert!(argv.contains(&"--interpreter-arg=-s"));
        assert!(argv.contains(&"--interpreter-arg=--norc"));
        assert_eq!(&argv[argv.len() - 2..], &["-f", "{connection_file}"]);
        assert_eq!(spec["language"], "bash");
        assert_eq!(spec["interrupt_mode"], "message");
    }

    #[test]
    fn test_write_spec_dir() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fake-exe");
        fs::write(&exe, b"binary").unwrap();

        let spec_dir = dir.path().join("spec");
        write_spec_dir(&spec_dir, &exe, &options()).unwrap();

        let written: Value =
            serde_json::from_str(&fs::read_to_string(spec_dir.join("kernel.json")).unwrap())
                .unwrap();
        assert_eq!(written, kernel_spec(&options()));
        assert_eq!(
            fs::read(spec_dir.join(executable_name())).unwrap(),
            b"binary"
        );
    }

    #[test]
    fn test_scope_flags() {
        assert_eq!(InstallScope::default().flag(), "--user");
        assert_eq!(InstallScope::SysPrefix.flag(), "--sys-prefix");
    }
}

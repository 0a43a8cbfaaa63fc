/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Commands for the wrapped package tools.
//!
//! The executor never builds command lines itself; it asks a [`Toolchain`]
//! for the steps of each phase and runs them as managed processes.

use std::fs;
use std::path::{Path, PathBuf};

use super::process::StepCommand;
use crate::config::Config;
use crate::error::{PacsmithError, PacsmithResult};
use crate::resolver::PlanItem;

const PACKAGE_EXTENSIONS: &[&str] = &[".pkg.tar", ".pkg.tar.zst", ".pkg.tar.xz", ".pkg.tar.gz"];

/// Command lines for each phase of a plan item
pub trait Toolchain: Send + Sync {
    /// Download step; `build_dir` is set for AUR items
    fn fetch(&self, item: &PlanItem, build_dir: Option<&Path>) -> Vec<StepCommand>;

    /// Build an AUR item in its build directory
    fn build(&self, item: &PlanItem, build_dir: &Path) -> Vec<StepCommand>;

    /// Install a repo item, or the given built artifacts of an AUR item
    fn install(&self, item: &PlanItem, artifacts: &[PathBuf], as_dependency: bool) -> Vec<StepCommand>;

    fn remove(&self, item: &PlanItem) -> Vec<StepCommand>;

    /// Package files produced by a successful build
    fn artifacts(&self, item: &PlanItem, build_dir: &Path) -> PacsmithResult<Vec<PathBuf>> {
        let built = find_built_packages(build_dir)?;
        let own: Vec<PathBuf> = built
            .iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(artifact_package_name)
                    == Some(item.name())
            })
            .cloned()
            .collect();
        // split packages may not follow the naming scheme; install all then
        Ok(if own.is_empty() { built } else { own })
    }
}

/// pacman + makepkg
pub struct PacmanToolchain {
    escalation: Vec<String>,
    makepkg_flags: Vec<String>,
    make_jobs: usize,
    disable_compression: bool,
    use_ccache: bool,
    running_as_root: bool,
    /// Unprivileged user for makepkg when running as root
    build_user: Option<String>,
}

impl PacmanToolchain {
    pub fn from_config(config: &Config) -> Self {
        let running_as_root = unsafe { libc::geteuid() } == 0;
        Self {
            escalation: config.transaction.escalation.clone(),
            makepkg_flags: config.aur.makepkg_flags.clone(),
            make_jobs: config.get_make_jobs(),
            disable_compression: config.aur.disable_compression,
            use_ccache: config.aur.use_ccache,
            running_as_root,
            build_user: std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty() && u != "root"),
        }
    }

    fn privileged(&self, command: StepCommand) -> StepCommand {
        if self.running_as_root {
            command
        } else {
            StepCommand::prefixed(&self.escalation, command)
        }
    }

    /// makepkg refuses to run as root, so drop to the invoking user.
    /// `sudo -u` resets the environment, hence the explicit `env`.
    fn makepkg(&self, args: Vec<String>, build_dir: &Path) -> StepCommand {
        let mut env = vec![
            ("MAKEFLAGS".to_string(), format!("-j{}", self.make_jobs)),
            (
                "PKGEXT".to_string(),
                if self.disable_compression { ".pkg.tar" } else { ".pkg.tar.zst" }.to_string(),
            ),
        ];
        if self.use_ccache {
            let path = std::env::var("PATH").unwrap_or_default();
            env.push(("PATH".to_string(), format!("/usr/lib/ccache/bin:{}", path)));
        }

        match (&self.build_user, self.running_as_root) {
            (Some(user), true) => StepCommand::new("sudo")
                .args(["-u", user.as_str(), "env"])
                .args(env.iter().map(|(k, v)| format!("{}={}", k, v)))
                .arg("makepkg")
                .args(args)
                .current_dir(build_dir),
            _ => {
                let mut command = StepCommand::new("makepkg").args(args).current_dir(build_dir);
                command.env = env;
                command
            }
        }
    }

    fn chown_for_build(&self, build_dir: &Path) -> Option<StepCommand> {
        match (&self.build_user, self.running_as_root) {
            (Some(user), true) => Some(
                StepCommand::new("chown")
                    .arg("-R")
                    .arg(format!("{}:", user))
                    .arg(build_dir.display().to_string()),
            ),
            _ => None,
        }
    }
}

fn qualified_name(item: &PlanItem) -> String {
    match item.record.repository.as_str() {
        "" | "sync" | "local" => item.name().to_string(),
        repo => format!("{}/{}", repo, item.name()),
    }
}

impl Toolchain for PacmanToolchain {
    fn fetch(&self, item: &PlanItem, build_dir: Option<&Path>) -> Vec<StepCommand> {
        match build_dir {
            Some(dir) => {
                let mut steps: Vec<StepCommand> = self.chown_for_build(dir).into_iter().collect();
                steps.push(self.makepkg(vec!["--verifysource".to_string(), "--noconfirm".to_string()], dir));
                steps
            }
            None => vec![self.privileged(
                StepCommand::new("pacman")
                    .args(["-Sw", "--noconfirm", "--"])
                    .arg(qualified_name(item)),
            )],
        }
    }

    fn build(&self, _item: &PlanItem, build_dir: &Path) -> Vec<StepCommand> {
        vec![self.makepkg(self.makepkg_flags.clone(), build_dir)]
    }

    fn install(&self, item: &PlanItem, artifacts: &[PathBuf], as_dependency: bool) -> Vec<StepCommand> {
        let mut command = if artifacts.is_empty() {
            StepCommand::new("pacman").args(["-S", "--noconfirm", "--needed"])
        } else {
            StepCommand::new("pacman").args(["-U", "--noconfirm"])
        };
        if as_dependency {
            command = command.arg("--asdeps");
        }
        command = command.arg("--");
        command = if artifacts.is_empty() {
            command.arg(qualified_name(item))
        } else {
            command.args(artifacts.iter().map(|p| p.display().to_string()))
        };
        vec![self.privileged(command)]
    }

    fn remove(&self, item: &PlanItem) -> Vec<StepCommand> {
        vec![self.privileged(
            StepCommand::new("pacman")
                .args(["-Rns", "--noconfirm", "--"])
                .arg(item.name()),
        )]
    }
}

/// Find built package files in a build directory
pub fn find_built_packages(build_dir: &Path) -> PacsmithResult<Vec<PathBuf>> {
    let entries = fs::read_dir(build_dir)
        .map_err(|e| PacsmithError::filesystem(build_dir, "cannot list build directory", e))?;

    let mut packages: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| PACKAGE_EXTENSIONS.iter().any(|ext| n.ends_with(ext)))
                .unwrap_or(false)
        })
        .collect();
    packages.sort();
    Ok(packages)
}

/// `name` out of `name-pkgver-pkgrel-arch.pkg.tar*`
fn artifact_package_name(file_name: &str) -> Option<&str> {
    let stem = &file_name[..file_name.find(".pkg.tar")?];
    let mut parts = stem.rsplitn(4, '-');
    let (_arch, _rel, _ver) = (parts.next()?, parts.next()?, parts.next()?);
    parts.next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Origin, PackageRecord};
    use crate::resolver::PlanAction;
    use std::sync::Arc;

    fn item(name: &str, origin: Origin, repo: &str) -> PlanItem {
        PlanItem {
            record: Arc::new(PackageRecord::new(name, "1.0-1", origin).in_repository(repo)),
            action: PlanAction::Install,
            required_by: vec![],
            depends_on: vec![],
            build_only: false,
        }
    }

    fn toolchain(root: bool, user: Option<&str>) -> PacmanToolchain {
        PacmanToolchain {
            escalation: vec!["sudo".to_string()],
            makepkg_flags: vec!["--syncdeps".to_string(), "--noconfirm".to_string()],
            make_jobs: 8,
            disable_compression: true,
            use_ccache: false,
            running_as_root: root,
            build_user: user.map(str::to_string),
        }
    }

    #[test]
    fn test_repo_item_commands() {
        let tc = toolchain(false, None);
        let bar = item("bar", Origin::BinaryRepo, "extra");

        let fetch = tc.fetch(&bar, None);
        assert_eq!(fetch[0].to_string(), "sudo pacman -Sw --noconfirm -- extra/bar");

        let install = tc.install(&bar, &[], true);
        assert_eq!(install[0].to_string(), "sudo pacman -S --noconfirm --needed --asdeps -- extra/bar");

        let remove = tc.remove(&bar);
        assert_eq!(remove[0].to_string(), "sudo pacman -Rns --noconfirm -- bar");
    }

    #[test]
    fn test_aur_build_as_user() {
        let tc = toolchain(false, None);
        let baz = item("baz", Origin::CommunitySource, "aur");
        let dir = Path::new("/tmp/pacsmith-aur/baz");

        let build = &tc.build(&baz, dir)[0];
        assert_eq!(build.to_string(), "makepkg --syncdeps --noconfirm");
        assert_eq!(build.cwd.as_deref(), Some(dir));
        assert!(build.env.contains(&("MAKEFLAGS".to_string(), "-j8".to_string())));
        assert!(build.env.contains(&("PKGEXT".to_string(), ".pkg.tar".to_string())));

        let install = tc.install(&baz, &[dir.join("baz-1.0-1-x86_64.pkg.tar")], false);
        assert_eq!(
            install[0].to_string(),
            "sudo pacman -U --noconfirm -- /tmp/pacsmith-aur/baz/baz-1.0-1-x86_64.pkg.tar"
        );
    }

    #[test]
    fn test_aur_build_as_root_drops_privileges() {
        let tc = toolchain(true, Some("alice"));
        let baz = item("baz", Origin::CommunitySource, "aur");
        let dir = Path::new("/tmp/pacsmith-aur/baz");

        let fetch = tc.fetch(&baz, Some(dir));
        assert_eq!(fetch.len(), 2);
        assert_eq!(fetch[0].to_string(), "chown -R alice: /tmp/pacsmith-aur/baz");
        assert!(fetch[1].to_string().starts_with("sudo -u alice env MAKEFLAGS=-j8 PKGEXT=.pkg.tar makepkg"));

        // already root: no escalation prefix
        let install = tc.install(&baz, &[], false);
        assert!(install[0].to_string().starts_with("pacman -S"));
    }

    #[test]
    fn test_artifact_package_name() {
        assert_eq!(artifact_package_name("foo-1.0-1-x86_64.pkg.tar.zst"), Some("foo"));
        assert_eq!(artifact_package_name("foo-bar-2:1.0.r3.gabc-2-any.pkg.tar"), Some("foo-bar"));
        assert_eq!(artifact_package_name("PKGBUILD"), None);
    }

    #[test]
    fn test_find_artifacts_for_split_package() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["foo-1.0-1-x86_64.pkg.tar", "foo-docs-1.0-1-any.pkg.tar.zst", "foo-1.0.tar.gz", "PKGBUILD"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let all = find_built_packages(dir.path()).unwrap();
        assert_eq!(all.len(), 2);

        let tc = toolchain(false, None);
        let foo = tc.artifacts(&item("foo", Origin::CommunitySource, "aur"), dir.path()).unwrap();
        assert_eq!(foo, vec![dir.path().join("foo-1.0-1-x86_64.pkg.tar")]);

        let other = tc.artifacts(&item("foo-git", Origin::CommunitySource, "aur"), dir.path()).unwrap();
        assert_eq!(other.len(), 2);
    }
}

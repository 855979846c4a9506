// gantry: a multi-language build system and test runner.
// Copyright (C) 2024 International Digital Economy Academy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// For inquiries, you can contact us via e-mail at jichuruanjian@idea.edu.cn.

//! Building one target: callbacks, cache probing, execution, output
//! collection and hash tagging.

use std::path::Path;
use std::sync::Arc;

use gantrycore::bus::Status;
use gantrycore::error::BuildError;
use gantrycore::target::{Target, TargetState};
use gantryutil::{fsattr, hash};
use log::{debug, warn};

use crate::queue::Task;
use crate::schedule::Scheduler;
use crate::worker::PoolKind;

impl Scheduler {
    /// Run a popped build task to completion.
    ///
    /// The `Pending -> Building` CAS is the idempotency guard: a stale or
    /// duplicated task (escalation, limiter requeue) simply fails it and is
    /// dropped.
    pub(crate) fn handle_build(
        &self,
        tid: i32,
        pool: PoolKind,
        target: &Arc<Target>,
        _subinclude: bool,
    ) {
        let graph = &self.state.graph;
        if !graph.cas_target(target, TargetState::Pending, TargetState::Building) {
            debug!("dropping duplicate build task for {}", target.label);
            return;
        }
        self.state.publish_status(
            tid,
            target.label.clone(),
            Status::Building,
            "Building...",
        );
        match self.build_target(tid, pool, target) {
            Ok(status) => {
                graph.cas_target(target, TargetState::Building, TargetState::Built);
                self.state.add_done(1);
                let description = match status {
                    Status::Reused => "Unchanged",
                    Status::Cached => "Cached",
                    _ => "Built",
                };
                self.state.publish(
                    gantrycore::BuildResult::new(tid, target.label.clone(), status, description)
                        .with_labels(target.labels.clone()),
                );
                if self.will_test(target) {
                    self.queue.push(Task::Test {
                        label: target.label.clone(),
                    });
                }
                self.on_built(tid, target);
            }
            Err(e) => self.fail_target(tid, target, e),
        }
    }

    fn build_target(
        &self,
        tid: i32,
        pool: PoolKind,
        target: &Arc<Target>,
    ) -> Result<Status, BuildError> {
        let package = self
            .state
            .graph
            .package_of(&target.label)
            .expect("building a target whose package is not in the graph");

        if target.has_pre_build {
            let _callbacks = package.build_callback_mutex.lock().unwrap();
            self.parser.run_pre_build(&self.state, target)?;
        }

        let hash = self.runtime_hash(target)?;
        target.set_runtime_hash(hash.clone());

        if self.outputs_up_to_date(target, &hash) {
            debug!("{} is up to date on disk", target.label);
            return Ok(Status::Reused);
        }
        if let Some(cache) = &self.cache {
            if cache.retrieve(target, &hash) {
                if self.outputs_up_to_date(target, &hash) {
                    return Ok(Status::Cached);
                }
                // Retrieved artifacts that don't verify are corrupt; drop
                // the entry and build from scratch.
                warn!("{}", BuildError::CacheCorrupt(target.label.clone()));
                cache.clean(target);
                for out in &target.outs {
                    fsattr::clear_artifact_hash(&self.state.target_out_path(target, out));
                }
            }
        }

        self.prepare_build_dir(target)?;
        let out = match pool {
            PoolKind::Local => self.executor.build(&self.state, target)?,
            PoolKind::Remote => self.executor.build_remotely(&self.state, target)?,
        };
        self.collect_outputs(target, &hash)?;

        if let Some(cache) = &self.cache {
            let paths: Vec<std::path::PathBuf> = target
                .outs
                .iter()
                .map(|o| self.state.target_out_path(target, o))
                .collect();
            let refs: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
            cache.store(target, &hash, &refs);
        }

        if target.has_post_build {
            {
                let _callbacks = package.build_callback_mutex.lock().unwrap();
                self.parser.run_post_build(&self.state, target, &out.stdout)?;
            }
            // The callback may have added targets or edges anywhere in the
            // package; re-run readiness over all of it.
            self.rescan_package(tid, &package);
        }

        if !self.state.options.keep_workdirs {
            let _ = std::fs::remove_dir_all(self.state.tmp_build_dir(target));
        }
        Ok(Status::Built)
    }

    /// Hash of everything relevant to this target's execution: identity,
    /// commands, declared outputs, source contents, and the hashes of its
    /// resolved dependencies.
    pub(crate) fn runtime_hash(&self, target: &Target) -> Result<String, BuildError> {
        let mut chunks: Vec<Vec<u8>> = vec![
            target.label.to_string().into_bytes(),
            target.command.clone().into_bytes(),
            target.test_command.clone().into_bytes(),
        ];
        for out in &target.outs {
            chunks.push(out.clone().into_bytes());
        }
        for src in &target.srcs {
            let path = self.state.source_path(&target.label.package, src);
            let content = std::fs::read(&path).map_err(|e| BuildError::BuildFailed {
                label: target.label.clone(),
                reason: format!("cannot read source `{src}`: {e}"),
            })?;
            chunks.push(src.clone().into_bytes());
            chunks.push(content);
        }
        for dep in self.state.graph.resolved_deps(target) {
            let dep_hash = self
                .state
                .graph
                .target(&dep)
                .and_then(|t| t.runtime_hash())
                .unwrap_or_else(|| dep.to_string());
            chunks.push(dep_hash.into_bytes());
        }
        Ok(hash::sha256_hex(chunks))
    }

    /// True when every declared output exists and carries the given
    /// runtime hash.
    fn outputs_up_to_date(&self, target: &Target, hash: &str) -> bool {
        if target.outs.is_empty() {
            return false;
        }
        target.outs.iter().all(|out| {
            let path = self.state.target_out_path(target, out);
            path.exists() && fsattr::read_artifact_hash(&path).as_deref() == Some(hash)
        })
    }

    /// Create the scratch build directory and stage the target's sources
    /// into it.
    fn prepare_build_dir(&self, target: &Target) -> Result<(), BuildError> {
        let build_dir = self.state.tmp_build_dir(target);
        let io = |e: std::io::Error, what: &str| BuildError::BuildFailed {
            label: target.label.clone(),
            reason: format!("{what}: {e}"),
        };
        let _ = std::fs::remove_dir_all(&build_dir);
        std::fs::create_dir_all(&build_dir).map_err(|e| io(e, "cannot create build dir"))?;
        for src in &target.srcs {
            let from = self.state.source_path(&target.label.package, src);
            let to = build_dir.join(src);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io(e, "cannot stage sources"))?;
            }
            std::fs::copy(&from, &to)
                .map_err(|e| io(e, &format!("cannot stage source `{src}`")))?;
        }
        // Dependencies' outputs are staged too, so commands can refer to
        // them the same way another target would.
        for dep in self.state.graph.resolved_deps(target) {
            if let Some(dep_target) = self.state.graph.target(&dep) {
                for out in &dep_target.outs {
                    let from = self.state.target_out_path(&dep_target, out);
                    if !from.exists() {
                        continue;
                    }
                    let to = build_dir.join(out);
                    if let Some(parent) = to.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| io(e, "cannot stage dependencies"))?;
                    }
                    std::fs::copy(&from, &to)
                        .map_err(|e| io(e, &format!("cannot stage dependency output `{out}`")))?;
                }
            }
        }
        Ok(())
    }

    /// Move declared outputs from the scratch dir into the durable out
    /// tree, tagging each with the runtime hash.
    fn collect_outputs(&self, target: &Target, hash: &str) -> Result<(), BuildError> {
        let build_dir = self.state.tmp_build_dir(target);
        let out_dir = self.state.target_out_dir(target);
        for out in &target.outs {
            let from = build_dir.join(out);
            let to = out_dir.join(out);
            if !from.exists() {
                return Err(BuildError::BuildFailed {
                    label: target.label.clone(),
                    reason: format!("rule did not produce declared output `{out}`"),
                });
            }
            let io = |e: std::io::Error| BuildError::BuildFailed {
                label: target.label.clone(),
                reason: format!("cannot collect output `{out}`: {e}"),
            };
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(io)?;
            }
            let _ = std::fs::remove_file(&to);
            if std::fs::rename(&from, &to).is_err() {
                std::fs::copy(&from, &to).map_err(io)?;
            }
            fsattr::write_artifact_hash(&to, hash).map_err(io)?;
        }
        Ok(())
    }
}

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use bundlepack_core::{
    ActionState, BundleManifest, CurrentState, LaunchAction, Package, RequestState,
};
use tracing::{debug, warn};

use crate::drivers;
use crate::error::EngineError;
use crate::registration::RelatedBundle;
use crate::ux::{check_reply, BootstrapperApplication};

/// What Detect learned about one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageState {
    pub current: CurrentState,
    pub cached: bool,
    pub install_condition: bool,
}

impl Default for PackageState {
    fn default() -> Self {
        Self {
            current: CurrentState::Unknown,
            cached: false,
            install_condition: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteAction {
    Checkpoint { id: u32 },
    RollbackBoundary { boundary: String },
    WaitSyncpoint { event: usize },
    Package { package: String, action: ActionState },
    UncachePackage { package: String },
    RelatedBundle { related: usize, action: ActionState },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
    Checkpoint { id: u32 },
    PackageStart {
        package: String,
        payload_count: usize,
        bytes: u64,
    },
    AcquireContainer { container: String },
    ExtractContainer {
        container: String,
        payloads: Vec<String>,
    },
    AcquirePayload { payload: String },
    CachePayload {
        package: String,
        payload: String,
        move_file: bool,
    },
    LayoutBundle { directory: PathBuf },
    LayoutPayload { payload: String, directory: PathBuf },
    PackageStop { package: String },
    SignalSyncpoint { event: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackCacheAction {
    Checkpoint { id: u32 },
    RollbackPackage { package: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanAction {
    pub package: String,
}

/// Per-package planning result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagePlan {
    pub id: String,
    pub current: CurrentState,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
    pub cache: bool,
    pub per_machine: bool,
    pub vital: bool,
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub action: LaunchAction,
    /// In planning order (reversed manifest order for uninstall).
    pub packages: Vec<PackagePlan>,
    pub cache_actions: Vec<CacheAction>,
    pub rollback_cache_actions: Vec<RollbackCacheAction>,
    pub execute_actions: Vec<ExecuteAction>,
    pub rollback_actions: Vec<ExecuteAction>,
    pub clean_actions: Vec<CleanAction>,
    pub sync_events: usize,
    pub per_machine: bool,
    pub keep_registration: bool,
    pub cache_bytes_total: u64,
    pub execute_steps_total: u64,
    pub related: Vec<RelatedBundle>,
    pub layout_directory: Option<PathBuf>,
}

impl Plan {
    fn new(action: LaunchAction) -> Self {
        Self {
            action,
            packages: Vec::new(),
            cache_actions: Vec::new(),
            rollback_cache_actions: Vec::new(),
            execute_actions: Vec::new(),
            rollback_actions: Vec::new(),
            clean_actions: Vec::new(),
            sync_events: 0,
            per_machine: false,
            keep_registration: true,
            cache_bytes_total: 0,
            execute_steps_total: 0,
            related: Vec::new(),
            layout_directory: None,
        }
    }

    pub fn package(&self, id: &str) -> Option<&PackagePlan> {
        self.packages.iter().find(|package| package.id == id)
    }

    pub fn is_layout(&self) -> bool {
        self.action == LaunchAction::Layout
    }
}

pub struct PlanInput<'a> {
    pub manifest: &'a BundleManifest,
    pub states: &'a [PackageState],
    pub action: LaunchAction,
    pub related: &'a [RelatedBundle],
    pub layout_directory: Option<PathBuf>,
}

/// Requested state before the interaction collaborator weighs in.
pub fn default_request(
    action: LaunchAction,
    package: &Package,
    state: &PackageState,
) -> RequestState {
    let removal = if package.permanent {
        RequestState::None
    } else {
        RequestState::Absent
    };
    match action {
        LaunchAction::Layout => RequestState::None,
        LaunchAction::Uninstall => removal,
        _ if !state.install_condition => removal,
        LaunchAction::Install => RequestState::Present,
        LaunchAction::Repair => RequestState::Repair,
        LaunchAction::Modify => match state.current {
            CurrentState::Present => RequestState::Present,
            CurrentState::Absent | CurrentState::Unknown => RequestState::None,
        },
    }
}

fn needs_payloads(package: &Package, execute: ActionState, requested: RequestState) -> bool {
    match execute {
        ActionState::None => matches!(requested, RequestState::Present | RequestState::Repair),
        ActionState::Install | ActionState::Repair => true,
        ActionState::Uninstall => package.kind().uninstall_needs_payloads(),
    }
}

struct Planner<'a> {
    manifest: &'a BundleManifest,
    plan: Plan,
    next_checkpoint: u32,
    open_boundary: Option<String>,
    boundary_event: Option<usize>,
    acquired_containers: HashSet<String>,
    payload_users: BTreeMap<&'a str, usize>,
}

impl<'a> Planner<'a> {
    fn new(manifest: &'a BundleManifest, action: LaunchAction) -> Self {
        let mut payload_users = BTreeMap::new();
        for package in &manifest.packages {
            for key in &package.payloads {
                *payload_users.entry(key.as_str()).or_insert(0) += 1;
            }
        }
        Self {
            manifest,
            plan: Plan::new(action),
            next_checkpoint: 1,
            open_boundary: None,
            boundary_event: None,
            acquired_containers: HashSet::new(),
            payload_users,
        }
    }

    fn checkpoint_id(&mut self) -> u32 {
        let id = self.next_checkpoint;
        self.next_checkpoint += 1;
        id
    }

    fn push_execute_checkpoint(&mut self) {
        let id = self.checkpoint_id();
        self.plan
            .execute_actions
            .push(ExecuteAction::Checkpoint { id });
        self.plan
            .rollback_actions
            .push(ExecuteAction::Checkpoint { id });
    }

    fn next_sync_event(&mut self) -> usize {
        let event = self.plan.sync_events;
        self.plan.sync_events += 1;
        event
    }

    /// Ends the open boundary once everything the cache plan scheduled for
    /// it has been signaled.
    fn close_boundary(&mut self) {
        if self.open_boundary.take().is_none() {
            return;
        }
        self.push_execute_checkpoint();
        if let Some(event) = self.boundary_event.take() {
            self.plan
                .cache_actions
                .push(CacheAction::SignalSyncpoint { event });
            self.plan
                .execute_actions
                .push(ExecuteAction::WaitSyncpoint { event });
            self.plan
                .rollback_actions
                .push(ExecuteAction::WaitSyncpoint { event });
        }
    }

    fn open_boundary(&mut self, boundary: &str) {
        self.close_boundary();
        let marker = ExecuteAction::RollbackBoundary {
            boundary: boundary.to_string(),
        };
        self.plan.execute_actions.push(marker.clone());
        self.plan.rollback_actions.push(marker);
        self.open_boundary = Some(boundary.to_string());
        self.boundary_event = Some(self.next_sync_event());
    }

    /// Appends the actions bringing `package`'s payloads into the working
    /// directory, grouped by container.
    fn push_acquire_actions(&mut self, package: &Package) {
        let mut by_container: Vec<(String, Vec<String>)> = Vec::new();
        for key in &package.payloads {
            let Some(payload) = self.manifest.payload(key) else {
                continue;
            };
            match &payload.container {
                Some(container) => {
                    match by_container.iter_mut().find(|(id, _)| id == container) {
                        Some((_, keys)) => keys.push(key.clone()),
                        None => by_container.push((container.clone(), vec![key.clone()])),
                    }
                }
                None => self.plan.cache_actions.push(CacheAction::AcquirePayload {
                    payload: key.clone(),
                }),
            }
        }

        for (container, payloads) in by_container {
            let attached = self
                .manifest
                .container(&container)
                .is_some_and(|container| container.attached);
            if !attached && self.acquired_containers.insert(container.clone()) {
                self.plan.cache_actions.push(CacheAction::AcquireContainer {
                    container: container.clone(),
                });
            }
            self.plan
                .cache_actions
                .push(CacheAction::ExtractContainer { container, payloads });
        }
    }

    fn package_bytes(&self, package: &Package) -> u64 {
        package
            .payloads
            .iter()
            .filter_map(|key| self.manifest.payload(key))
            .map(|payload| payload.size)
            .sum()
    }

    /// Schedules caching for `package` and returns the sync event signaled
    /// once its payloads are in the content store.
    fn push_cache_actions(&mut self, package: &Package) -> usize {
        let id = self.checkpoint_id();
        self.plan
            .cache_actions
            .push(CacheAction::Checkpoint { id });
        self.plan
            .rollback_cache_actions
            .push(RollbackCacheAction::Checkpoint { id });
        self.plan
            .rollback_cache_actions
            .push(RollbackCacheAction::RollbackPackage {
                package: package.id.clone(),
            });

        let bytes = self.package_bytes(package);
        self.plan.cache_actions.push(CacheAction::PackageStart {
            package: package.id.clone(),
            payload_count: package.payloads.len(),
            bytes,
        });
        self.push_acquire_actions(package);
        for key in &package.payloads {
            let shared = self
                .payload_users
                .get(key.as_str())
                .is_some_and(|users| *users > 1);
            self.plan.cache_actions.push(CacheAction::CachePayload {
                package: package.id.clone(),
                payload: key.clone(),
                move_file: !shared,
            });
        }
        self.plan.cache_actions.push(CacheAction::PackageStop {
            package: package.id.clone(),
        });

        let event = self.next_sync_event();
        self.plan
            .cache_actions
            .push(CacheAction::SignalSyncpoint { event });
        self.plan.cache_bytes_total += bytes;
        event
    }

    fn plan_layout(
        &mut self,
        input: &PlanInput<'_>,
        ux: &dyn BootstrapperApplication,
    ) -> Result<()> {
        let directory = input.layout_directory.clone().ok_or_else(|| {
            EngineError::InvalidPlan("layout requires a target directory".to_string())
        })?;
        self.plan.layout_directory = Some(directory.clone());
        self.plan.cache_actions.push(CacheAction::LayoutBundle {
            directory: directory.clone(),
        });

        let mut laid_out = HashSet::new();
        for (package, state) in input.manifest.packages.iter().zip(input.states) {
            let mut requested = RequestState::None;
            check_reply(
                ux.on_plan_package_begin(&package.id, &mut requested),
                "on_plan_package_begin",
            )?;

            let bytes = self.package_bytes(package);
            self.plan.cache_actions.push(CacheAction::PackageStart {
                package: package.id.clone(),
                payload_count: package.payloads.len(),
                bytes,
            });
            self.push_acquire_actions(package);
            for key in &package.payloads {
                if laid_out.insert(key.clone()) {
                    self.plan.cache_actions.push(CacheAction::LayoutPayload {
                        payload: key.clone(),
                        directory: directory.clone(),
                    });
                }
            }
            self.plan.cache_actions.push(CacheAction::PackageStop {
                package: package.id.clone(),
            });
            self.plan.cache_bytes_total += bytes;

            self.plan.packages.push(PackagePlan {
                id: package.id.clone(),
                current: state.current,
                requested: RequestState::None,
                execute: ActionState::None,
                rollback: ActionState::None,
                cache: true,
                per_machine: package.per_machine,
                vital: package.vital,
                permanent: package.permanent,
            });
            ux.on_plan_package_complete(
                &package.id,
                RequestState::None,
                ActionState::None,
                ActionState::None,
            );
        }
        Ok(())
    }

    fn plan_package(
        &mut self,
        package: &Package,
        state: &PackageState,
        ux: &dyn BootstrapperApplication,
    ) -> Result<()> {
        if let Some(boundary) = &package.rollback_boundary {
            if self.open_boundary.as_deref() != Some(boundary.as_str()) {
                self.open_boundary(boundary);
            }
        }

        let default = default_request(self.plan.action, package, state);
        let mut requested = default;
        check_reply(
            ux.on_plan_package_begin(&package.id, &mut requested),
            "on_plan_package_begin",
        )?;

        let (execute, rollback) = drivers::plan_actions(package, state.current, requested);
        if requested != default {
            let already_there = matches!(
                (state.current, requested),
                (CurrentState::Present, RequestState::Present)
                    | (CurrentState::Absent | CurrentState::Unknown, RequestState::Absent)
            );
            if requested != RequestState::None && execute.is_none() && !already_there {
                warn!(
                    package = %package.id,
                    current = state.current.as_str(),
                    requested = requested.as_str(),
                    "requested state override maps to no action"
                );
            }
        }

        let cache = requested != RequestState::None
            && !state.cached
            && needs_payloads(package, execute, requested);
        let sync_event = cache.then(|| self.push_cache_actions(package));

        if !execute.is_none() || !rollback.is_none() {
            if let Some(event) = sync_event {
                self.plan
                    .execute_actions
                    .push(ExecuteAction::WaitSyncpoint { event });
                self.plan
                    .rollback_actions
                    .push(ExecuteAction::UncachePackage {
                        package: package.id.clone(),
                    });
            }
            if !execute.is_none() {
                self.plan.execute_actions.push(ExecuteAction::Package {
                    package: package.id.clone(),
                    action: execute,
                });
                self.plan.execute_steps_total += 1;
            }
            if !rollback.is_none() {
                self.plan.rollback_actions.push(ExecuteAction::Package {
                    package: package.id.clone(),
                    action: rollback,
                });
            }
            self.push_execute_checkpoint();
            if package.per_machine {
                self.plan.per_machine = true;
            }
        }
        if cache && package.per_machine {
            self.plan.per_machine = true;
        }

        let has_cache = state.cached || cache;
        let ends_absent = state.current.after(execute) != CurrentState::Present;
        let removed = execute == ActionState::Uninstall || (ends_absent && requested != RequestState::None);
        if removed || (has_cache && !package.keep_cached) || (has_cache && ends_absent) {
            self.plan.clean_actions.push(CleanAction {
                package: package.id.clone(),
            });
        }

        debug!(
            package = %package.id,
            current = state.current.as_str(),
            requested = requested.as_str(),
            execute = execute.as_str(),
            rollback = rollback.as_str(),
            cache,
            "planned package"
        );
        self.plan.packages.push(PackagePlan {
            id: package.id.clone(),
            current: state.current,
            requested,
            execute,
            rollback,
            cache,
            per_machine: package.per_machine,
            vital: package.vital,
            permanent: package.permanent,
        });
        ux.on_plan_package_complete(&package.id, requested, execute, rollback);
        Ok(())
    }

    fn plan_related(&mut self, related: &[RelatedBundle]) {
        self.plan.related = related.to_vec();
        if !matches!(
            self.plan.action,
            LaunchAction::Install | LaunchAction::Repair | LaunchAction::Modify
        ) {
            return;
        }
        let version = &self.manifest.bundle.version;
        for (index, bundle) in related.iter().enumerate() {
            if bundle.version >= *version {
                debug!(related = %bundle.bundle_id, version = %bundle.version, "related bundle is not older");
                continue;
            }
            self.plan.execute_actions.push(ExecuteAction::RelatedBundle {
                related: index,
                action: ActionState::Uninstall,
            });
            self.plan.execute_steps_total += 1;
            self.push_execute_checkpoint();
            if bundle.per_machine {
                self.plan.per_machine = true;
            }
        }
    }
}

/// Turns detected state and the requested top-level action into the cache,
/// execute, and rollback plans.
pub fn build_plan(input: &PlanInput<'_>, ux: &dyn BootstrapperApplication) -> Result<Plan> {
    let manifest = input.manifest;
    if input.states.len() != manifest.packages.len() {
        return Err(EngineError::InvalidPlan(format!(
            "detected {} package states for {} packages",
            input.states.len(),
            manifest.packages.len()
        ))
        .into());
    }

    let mut planner = Planner::new(manifest, input.action);
    if input.action == LaunchAction::Layout {
        planner.plan_layout(input, ux)?;
        return Ok(planner.plan);
    }

    let mut order: Vec<usize> = (0..manifest.packages.len()).collect();
    if input.action == LaunchAction::Uninstall {
        order.reverse();
    }
    for index in order {
        planner.plan_package(&manifest.packages[index], &input.states[index], ux)?;
    }
    planner.close_boundary();
    planner.plan_related(input.related);

    let plan = &mut planner.plan;
    plan.per_machine |= manifest.bundle.per_machine;
    plan.keep_registration = input.action != LaunchAction::Uninstall
        || plan
            .packages
            .iter()
            .any(|package| !package.permanent && package.current.after(package.execute) == CurrentState::Present);
    Ok(planner.plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ux::{SilentApplication, UxReply};
    use std::sync::Mutex;

    const MANIFEST: &str = r#"
[bundle]
id = "suite"
version = "2.0.0"
upgrade_code = "{UP}"

[[containers]]
id = "main"
attached = true
attached_index = 0
primary = true

[[payloads]]
key = "x.msi"
file_path = "x.msi"
container = "main"
size = 3

[[payloads]]
key = "y.msi"
file_path = "y.msi"
container = "main"
size = 4

[[rollback_boundaries]]
id = "core"

[[rollback_boundaries]]
id = "extras"
vital = false

[[packages]]
id = "X"
kind = "msi"
product_code = "{11111111-1111-1111-1111-111111111111}"
rollback_boundary = "core"
payloads = ["x.msi"]

[[packages]]
id = "Y"
kind = "msi"
product_code = "{22222222-2222-2222-2222-222222222222}"
vital = false
rollback_boundary = "extras"
payloads = ["y.msi"]
"#;

    fn manifest() -> BundleManifest {
        BundleManifest::from_toml_str(MANIFEST).expect("manifest must parse")
    }

    fn state(current: CurrentState, cached: bool) -> PackageState {
        PackageState {
            current,
            cached,
            install_condition: true,
        }
    }

    fn plan(action: LaunchAction, states: &[PackageState]) -> Plan {
        let manifest = manifest();
        build_plan(
            &PlanInput {
                manifest: &manifest,
                states,
                action,
                related: &[],
                layout_directory: None,
            },
            &SilentApplication,
        )
        .expect("plan must build")
    }

    #[test]
    fn install_plan_brackets_packages_with_boundaries_and_checkpoints() {
        let plan = plan(
            LaunchAction::Install,
            &[
                state(CurrentState::Absent, false),
                state(CurrentState::Present, true),
            ],
        );
        assert_eq!(
            plan.execute_actions,
            vec![
                ExecuteAction::RollbackBoundary {
                    boundary: "core".to_string()
                },
                ExecuteAction::WaitSyncpoint { event: 1 },
                ExecuteAction::Package {
                    package: "X".to_string(),
                    action: ActionState::Install
                },
                ExecuteAction::Checkpoint { id: 2 },
                ExecuteAction::Checkpoint { id: 3 },
                ExecuteAction::WaitSyncpoint { event: 0 },
                ExecuteAction::RollbackBoundary {
                    boundary: "extras".to_string()
                },
                ExecuteAction::Checkpoint { id: 4 },
                ExecuteAction::WaitSyncpoint { event: 2 },
            ]
        );
        assert_eq!(
            plan.rollback_actions,
            vec![
                ExecuteAction::RollbackBoundary {
                    boundary: "core".to_string()
                },
                ExecuteAction::UncachePackage {
                    package: "X".to_string()
                },
                ExecuteAction::Package {
                    package: "X".to_string(),
                    action: ActionState::Uninstall
                },
                ExecuteAction::Checkpoint { id: 2 },
                ExecuteAction::Checkpoint { id: 3 },
                ExecuteAction::WaitSyncpoint { event: 0 },
                ExecuteAction::RollbackBoundary {
                    boundary: "extras".to_string()
                },
                ExecuteAction::Checkpoint { id: 4 },
                ExecuteAction::WaitSyncpoint { event: 2 },
            ]
        );
        let signals: Vec<usize> = plan
            .cache_actions
            .iter()
            .filter_map(|action| match action {
                CacheAction::SignalSyncpoint { event } => Some(*event),
                _ => None,
            })
            .collect();
        assert_eq!(signals, vec![1, 0, 2]);
        assert_eq!(plan.sync_events, 3);
        assert_eq!(plan.execute_steps_total, 1);
        assert_eq!(plan.cache_bytes_total, 3);
        assert!(plan.keep_registration);
    }

    #[test]
    fn plans_are_deterministic() {
        let states = [
            state(CurrentState::Absent, false),
            state(CurrentState::Absent, false),
        ];
        assert_eq!(
            plan(LaunchAction::Install, &states),
            plan(LaunchAction::Install, &states)
        );
    }

    #[test]
    fn checkpoint_ids_strictly_increase() {
        let plan = plan(
            LaunchAction::Install,
            &[
                state(CurrentState::Absent, false),
                state(CurrentState::Absent, false),
            ],
        );
        let mut ids = plan
            .execute_actions
            .iter()
            .filter_map(|action| match action {
                ExecuteAction::Checkpoint { id } => Some(*id),
                _ => None,
            })
            .collect::<Vec<_>>();
        ids.extend(plan.cache_actions.iter().filter_map(|action| match action {
            CacheAction::Checkpoint { id } => Some(*id),
            _ => None,
        }));
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before, "checkpoint ids must be unique");

        let execute_ids = plan
            .execute_actions
            .iter()
            .filter_map(|action| match action {
                ExecuteAction::Checkpoint { id } => Some(*id),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(execute_ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn uninstall_runs_in_reverse_and_drops_registration() {
        let plan = plan(
            LaunchAction::Uninstall,
            &[
                state(CurrentState::Present, true),
                state(CurrentState::Present, true),
            ],
        );
        let packages = plan
            .execute_actions
            .iter()
            .filter_map(|action| match action {
                ExecuteAction::Package { package, action } => Some((package.as_str(), *action)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            packages,
            vec![("Y", ActionState::Uninstall), ("X", ActionState::Uninstall)]
        );
        assert!(plan
            .cache_actions
            .iter()
            .all(|action| matches!(action, CacheAction::SignalSyncpoint { .. })));
        assert!(!plan.keep_registration);
        assert_eq!(
            plan.clean_actions,
            vec![
                CleanAction {
                    package: "Y".to_string()
                },
                CleanAction {
                    package: "X".to_string()
                }
            ]
        );
    }

    #[test]
    fn shared_container_is_extracted_per_package_but_never_acquired() {
        let plan = plan(
            LaunchAction::Install,
            &[
                state(CurrentState::Absent, false),
                state(CurrentState::Absent, false),
            ],
        );
        assert!(!plan
            .cache_actions
            .iter()
            .any(|action| matches!(action, CacheAction::AcquireContainer { .. })));
        let extracts = plan
            .cache_actions
            .iter()
            .filter(|action| matches!(action, CacheAction::ExtractContainer { .. }))
            .count();
        assert_eq!(extracts, 2);
        assert_eq!(plan.sync_events, 4);
    }

    struct Override {
        seen: Mutex<Vec<String>>,
    }

    impl BootstrapperApplication for Override {
        fn on_plan_package_begin(&self, package_id: &str, requested: &mut RequestState) -> UxReply {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(package_id.to_string());
            }
            if package_id == "Y" {
                *requested = RequestState::Absent;
            }
            UxReply::Continue
        }
    }

    #[test]
    fn collaborator_override_changes_requested_state() {
        let manifest = manifest();
        let ux = Override {
            seen: Mutex::new(Vec::new()),
        };
        let plan = build_plan(
            &PlanInput {
                manifest: &manifest,
                states: &[
                    state(CurrentState::Absent, false),
                    state(CurrentState::Present, true),
                ],
                action: LaunchAction::Install,
                related: &[],
                layout_directory: None,
            },
            &ux,
        )
        .expect("plan");
        let y = plan.package("Y").expect("Y planned");
        assert_eq!(y.requested, RequestState::Absent);
        assert_eq!(y.execute, ActionState::Uninstall);
        assert_eq!(y.rollback, ActionState::Install);
        assert_eq!(
            ux.seen.lock().expect("seen").as_slice(),
            ["X".to_string(), "Y".to_string()]
        );
    }

    #[test]
    fn older_related_bundles_are_removed_after_packages() {
        let manifest = manifest();
        let related = vec![
            RelatedBundle {
                bundle_id: "suite-1".to_string(),
                version: semver::Version::new(1, 0, 0),
                per_machine: false,
                engine_path: PathBuf::from("/c/engine"),
                manifest_path: PathBuf::from("/c/bundle.toml"),
            },
            RelatedBundle {
                bundle_id: "suite-3".to_string(),
                version: semver::Version::new(3, 0, 0),
                per_machine: false,
                engine_path: PathBuf::from("/c/engine"),
                manifest_path: PathBuf::from("/c/bundle.toml"),
            },
        ];
        let plan = build_plan(
            &PlanInput {
                manifest: &manifest,
                states: &[
                    state(CurrentState::Present, true),
                    state(CurrentState::Present, true),
                ],
                action: LaunchAction::Install,
                related: &related,
                layout_directory: None,
            },
            &SilentApplication,
        )
        .expect("plan");
        let related_actions = plan
            .execute_actions
            .iter()
            .filter(|action| matches!(action, ExecuteAction::RelatedBundle { .. }))
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(
            related_actions,
            vec![ExecuteAction::RelatedBundle {
                related: 0,
                action: ActionState::Uninstall
            }]
        );
        assert_eq!(plan.related.len(), 2);
    }

    #[test]
    fn layout_requires_directory_and_skips_execution() {
        let manifest = manifest();
        let states = [PackageState::default(), PackageState::default()];
        let missing = build_plan(
            &PlanInput {
                manifest: &manifest,
                states: &states,
                action: LaunchAction::Layout,
                related: &[],
                layout_directory: None,
            },
            &SilentApplication,
        );
        assert!(missing.is_err());

        let plan = build_plan(
            &PlanInput {
                manifest: &manifest,
                states: &states,
                action: LaunchAction::Layout,
                related: &[],
                layout_directory: Some(PathBuf::from("/out")),
            },
            &SilentApplication,
        )
        .expect("layout plan");
        assert!(plan.execute_actions.is_empty());
        assert_eq!(
            plan.cache_actions.first(),
            Some(&CacheAction::LayoutBundle {
                directory: PathBuf::from("/out")
            })
        );
        let layouts = plan
            .cache_actions
            .iter()
            .filter(|action| matches!(action, CacheAction::LayoutPayload { .. }))
            .count();
        assert_eq!(layouts, 2);
    }

    #[test]
    fn mismatched_state_count_is_a_plan_error() {
        let manifest = manifest();
        let result = build_plan(
            &PlanInput {
                manifest: &manifest,
                states: &[PackageState::default()],
                action: LaunchAction::Install,
                related: &[],
                layout_directory: None,
            },
            &SilentApplication,
        );
        assert!(result.is_err());
    }
}

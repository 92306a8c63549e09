//! # Lifecycle Hook Dispatcher (spec §4.H)
//!
//! A process-global registry of callbacks invoked on entity- and
//! component-lifecycle events, dispatched with priority ordering, optional
//! filtering, bounded concurrency for async hooks, per-hook timeouts, and
//! error isolation — a hook failure is recorded but never fails the
//! originating save or delete (spec §7 `HookError`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::id::{EntityId, TypeId};

/// The closed set of lifecycle events a hook can subscribe to.
#[derive(Debug, Clone)]
pub enum HookEvent {
    /// A brand-new entity was persisted for the first time.
    EntityCreated {
        /// The entity that was created.
        entity_id: EntityId,
    },
    /// An already-persisted entity was saved again with component changes.
    EntityUpdated {
        /// The entity that changed.
        entity_id: EntityId,
        /// Type ids of the components that were inserted, updated, or removed.
        changed_type_ids: Vec<TypeId>,
    },
    /// An entity was deleted.
    EntityDeleted {
        /// The entity that was deleted.
        entity_id: EntityId,
        /// `true` for a soft delete, `false` for a hard delete.
        soft: bool,
    },
    /// A component was attached to an entity for the first time.
    ComponentAdded {
        /// The owning entity.
        entity_id: EntityId,
        /// The component's type.
        type_id: TypeId,
    },
    /// An already-attached component's payload was updated in place.
    ComponentUpdated {
        /// The owning entity.
        entity_id: EntityId,
        /// The component's type.
        type_id: TypeId,
        /// The payload before the update.
        old: Value,
        /// The payload after the update.
        new: Value,
    },
    /// A component was removed from an entity.
    ComponentRemoved {
        /// The owning entity.
        entity_id: EntityId,
        /// The component's type.
        type_id: TypeId,
    },
}

/// The discriminant of a [`HookEvent`], used as the registration/dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`HookEvent::EntityCreated`].
    EntityCreated,
    /// See [`HookEvent::EntityUpdated`].
    EntityUpdated,
    /// See [`HookEvent::EntityDeleted`].
    EntityDeleted,
    /// See [`HookEvent::ComponentAdded`].
    ComponentAdded,
    /// See [`HookEvent::ComponentUpdated`].
    ComponentUpdated,
    /// See [`HookEvent::ComponentRemoved`].
    ComponentRemoved,
}

impl HookEvent {
    /// Returns this event's discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            HookEvent::EntityCreated { .. } => EventKind::EntityCreated,
            HookEvent::EntityUpdated { .. } => EventKind::EntityUpdated,
            HookEvent::EntityDeleted { .. } => EventKind::EntityDeleted,
            HookEvent::ComponentAdded { .. } => EventKind::ComponentAdded,
            HookEvent::ComponentUpdated { .. } => EventKind::ComponentUpdated,
            HookEvent::ComponentRemoved { .. } => EventKind::ComponentRemoved,
        }
    }

    /// The component type this event concerns, if any (entity-level events
    /// have none). Used by the component-targeted registration variants to
    /// filter by type-id before invoking (spec §4.H "Registration").
    pub fn component_type_id(&self) -> Option<TypeId> {
        match self {
            HookEvent::ComponentAdded { type_id, .. }
            | HookEvent::ComponentUpdated { type_id, .. }
            | HookEvent::ComponentRemoved { type_id, .. } => Some(*type_id),
            _ => None,
        }
    }
}

type HookFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type HookCallback = Arc<dyn Fn(HookEvent) -> HookFuture + Send + Sync>;
type HookFilter = Arc<dyn Fn(&HookEvent) -> bool + Send + Sync>;

/// Registration-time options for one hook (spec §4.H "Registration").
#[derive(Clone)]
pub struct HookOptions {
    /// Higher runs first; ties broken by registration order.
    pub priority: i32,
    /// A human-readable name, surfaced in introspection and error reports.
    pub name: Option<String>,
    /// Whether this hook may run concurrently with others in the same
    /// dispatch, bounded by `max_concurrency`, rather than blocking the
    /// hooks after it in priority order.
    pub asynchronous: bool,
    /// An additional predicate evaluated before invocation; combined with
    /// the implicit component-type-id filter, if the registration has one.
    pub filter: Option<HookFilter>,
    /// Per-invocation timeout; a hook that exceeds this is recorded as failed.
    pub timeout: Option<Duration>,
    /// When `false`, the first hook failure at or below this hook's position
    /// stops any not-yet-started hook in the same dispatch from running.
    pub continue_on_error: bool,
    /// Upper bound on concurrent in-flight invocations of this one hook
    /// (across dispatches), only meaningful when `asynchronous` is set.
    pub max_concurrency: usize,
}

impl Default for HookOptions {
    fn default() -> Self {
        HookOptions {
            priority: 0,
            name: None,
            asynchronous: false,
            filter: None,
            timeout: None,
            continue_on_error: true,
            max_concurrency: 4,
        }
    }
}

/// A registered hook, introspectable via [`HookDispatcher::registered`].
#[derive(Clone)]
pub struct HookMetadata {
    /// Stable id assigned at registration.
    pub id: u64,
    /// The event kind this hook subscribes to.
    pub event_kind: EventKind,
    /// This hook's registration priority.
    pub priority: i32,
    /// This hook's name, if any.
    pub name: Option<String>,
    /// When this hook was registered.
    pub registered_at: DateTime<Utc>,
}

struct Registration {
    metadata: HookMetadata,
    callback: HookCallback,
    component_type_id: Option<TypeId>,
    options: HookOptions,
    semaphore: Arc<Semaphore>,
    sequence: u64,
}

/// The outcome of one hook's invocation within a dispatch.
#[derive(Debug, Clone)]
pub struct HookResult {
    /// The hook's stable id.
    pub hook_id: u64,
    /// The hook's registered name, if any.
    pub name: Option<String>,
    /// Whether the hook completed without error or timeout.
    pub success: bool,
    /// The error message, if any.
    pub error: Option<String>,
    /// Whether this failure was specifically a timeout.
    pub timed_out: bool,
    /// How long the hook took to run (or to time out).
    pub duration: Duration,
}

/// Aggregate result of one [`HookDispatcher::dispatch`] call (spec §4.H
/// dispatch algorithm step 6).
#[derive(Debug, Clone)]
pub struct BatchHookResult {
    /// Total hooks actually invoked this dispatch.
    pub total_hooks: usize,
    /// Hooks that completed successfully.
    pub successful: usize,
    /// Hooks that failed or timed out.
    pub failed: usize,
    /// Wall-clock time for the whole dispatch.
    pub total_execution_time: Duration,
    /// Per-hook detail, in invocation order.
    pub per_hook_results: Vec<HookResult>,
}

#[derive(Default, Clone, Copy)]
struct EventStats {
    count: u64,
    total_duration: Duration,
    errors: u64,
}

/// Point-in-time statistics for one event kind (spec §4.H "State").
#[derive(Debug, Clone, Copy)]
pub struct EventStatsSnapshot {
    /// Number of hook invocations dispatched for this event kind.
    pub count: u64,
    /// Average invocation duration in milliseconds.
    pub avg_duration_ms: f64,
    /// Fraction of invocations that failed, in `[0.0, 1.0]`.
    pub error_rate: f64,
}

struct Inner {
    by_kind: HashMap<EventKind, Vec<Registration>>,
    stats: HashMap<EventKind, EventStats>,
}

/// Process-global dispatcher, constructed once at startup and shared via
/// `Arc` (spec §9 "Global process state").
pub struct HookDispatcher {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    next_sequence: AtomicU64,
}

impl Default for HookDispatcher {
    fn default() -> Self {
        HookDispatcher::new()
    }
}

impl HookDispatcher {
    /// Builds an empty dispatcher.
    pub fn new() -> Self {
        HookDispatcher {
            inner: RwLock::new(Inner {
                by_kind: HashMap::new(),
                stats: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Registers a hook for `event_kind`, returning its stable id.
    pub fn on<F, Fut>(&self, event_kind: EventKind, options: HookOptions, callback: F) -> u64
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.register(event_kind, None, options, callback)
    }

    /// Registers a hook for `event_kind` that only fires for the given
    /// component type (spec §4.H "Component-targeted variants filter by
    /// type-ID before invoking").
    pub fn on_component<F, Fut>(
        &self,
        event_kind: EventKind,
        type_id: TypeId,
        options: HookOptions,
        callback: F,
    ) -> u64
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.register(event_kind, Some(type_id), options, callback)
    }

    fn register<F, Fut>(
        &self,
        event_kind: EventKind,
        component_type_id: Option<TypeId>,
        options: HookOptions,
        callback: F,
    ) -> u64
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
        let metadata = HookMetadata {
            id,
            event_kind,
            priority: options.priority,
            name: options.name.clone(),
            registered_at: Utc::now(),
        };
        let callback: HookCallback = Arc::new(move |event| Box::pin(callback(event)));

        let mut inner = self.inner.write().unwrap();
        inner.by_kind.entry(event_kind).or_default().push(Registration {
            metadata,
            callback,
            component_type_id,
            options,
            semaphore,
            sequence,
        });
        id
    }

    /// Removes a previously registered hook. Returns whether one was removed.
    pub fn remove(&self, hook_id: u64) -> bool {
        let mut inner = self.inner.write().unwrap();
        for registrations in inner.by_kind.values_mut() {
            if let Some(pos) = registrations.iter().position(|r| r.metadata.id == hook_id) {
                registrations.remove(pos);
                return true;
            }
        }
        false
    }

    /// Introspects every hook registered for `event_kind` (spec §4.H "Per-hook
    /// metadata ... is introspectable").
    pub fn registered(&self, event_kind: EventKind) -> Vec<HookMetadata> {
        let inner = self.inner.read().unwrap();
        inner
            .by_kind
            .get(&event_kind)
            .map(|regs| regs.iter().map(|r| r.metadata.clone()).collect())
            .unwrap_or_default()
    }

    /// Current statistics for `event_kind` (spec §4.H "count, avg time, error
    /// rate").
    pub fn stats(&self, event_kind: EventKind) -> EventStatsSnapshot {
        let inner = self.inner.read().unwrap();
        let stats = inner.stats.get(&event_kind).copied().unwrap_or_default();
        let avg_duration_ms = if stats.count > 0 {
            stats.total_duration.as_secs_f64() * 1000.0 / stats.count as f64
        } else {
            0.0
        };
        let error_rate = if stats.count > 0 {
            stats.errors as f64 / stats.count as f64
        } else {
            0.0
        };
        EventStatsSnapshot {
            count: stats.count,
            avg_duration_ms,
            error_rate,
        }
    }

    /// Runs every filter-matching hook for `event`'s kind, in priority order,
    /// and returns the aggregate result (spec §4.H dispatch algorithm
    /// steps 1-7). Never returns an error: hook failures are reported in the
    /// result, not propagated, so the originating save/delete always
    /// succeeds independently of hook outcomes.
    pub async fn dispatch(&self, event: HookEvent) -> BatchHookResult {
        let kind = event.kind();
        let component_type_id = event.component_type_id();
        let started = Instant::now();

        let mut candidates: Vec<(HookCallback, Option<Duration>, bool, bool, u64, Option<String>, Arc<Semaphore>)> = {
            let inner = self.inner.read().unwrap();
            let mut regs: Vec<&Registration> = inner
                .by_kind
                .get(&kind)
                .map(|v| v.iter().collect())
                .unwrap_or_default();

            regs.retain(|r| match r.component_type_id {
                Some(wanted) => component_type_id == Some(wanted),
                None => true,
            });
            regs.retain(|r| match &r.options.filter {
                Some(filter) => filter(&event),
                None => true,
            });
            regs.sort_by(|a, b| {
                b.options
                    .priority
                    .cmp(&a.options.priority)
                    .then(a.sequence.cmp(&b.sequence))
            });

            regs.into_iter()
                .map(|r| {
                    (
                        Arc::clone(&r.callback),
                        r.options.timeout,
                        r.options.asynchronous,
                        r.options.continue_on_error,
                        r.metadata.id,
                        r.metadata.name.clone(),
                        Arc::clone(&r.semaphore),
                    )
                })
                .collect()
        };
        // Keep registration order stable beyond this point; `candidates`
        // already reflects priority order.
        let _ = &mut candidates;

        let mut results: Vec<HookResult> = Vec::with_capacity(candidates.len());
        let mut pending: Vec<tokio::task::JoinHandle<HookResult>> = Vec::new();
        let mut aborted = false;

        for (callback, timeout, asynchronous, continue_on_error, hook_id, name, semaphore) in candidates {
            if aborted {
                break;
            }

            if asynchronous {
                let event_clone = event.clone();
                let name_for_task = name.clone();
                pending.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    run_one(hook_id, name_for_task, callback, event_clone, timeout).await
                }));
                if !continue_on_error {
                    // Async hooks cannot be known to fail before completion;
                    // this hook's own failure is evaluated once joined below.
                }
            } else {
                let result = run_one(hook_id, name.clone(), callback, event.clone(), timeout).await;
                if !result.success && !continue_on_error {
                    aborted = true;
                }
                results.push(result);
            }
        }

        for handle in pending {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(HookResult {
                    hook_id: 0,
                    name: None,
                    success: false,
                    error: Some(format!("hook task panicked: {join_err}")),
                    timed_out: false,
                    duration: Duration::default(),
                }),
            }
        }

        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        let total_execution_time = started.elapsed();

        {
            let mut inner = self.inner.write().unwrap();
            let stats = inner.stats.entry(kind).or_default();
            stats.count += results.len() as u64;
            stats.errors += failed as u64;
            stats.total_duration += results.iter().map(|r| r.duration).sum::<Duration>();
        }

        if failed > 0 {
            tracing::warn!(
                event_kind = ?kind,
                total = results.len(),
                failed,
                "lifecycle hook dispatch reported failures"
            );
        }

        BatchHookResult {
            total_hooks: results.len(),
            successful,
            failed,
            total_execution_time,
            per_hook_results: results,
        }
    }
}

async fn run_one(
    hook_id: u64,
    name: Option<String>,
    callback: HookCallback,
    event: HookEvent,
    timeout: Option<Duration>,
) -> HookResult {
    let started = Instant::now();
    let future = callback(event);

    let outcome = match timeout {
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(inner) => inner,
            Err(_) => {
                return HookResult {
                    hook_id,
                    name,
                    success: false,
                    error: Some("hook timed out".to_string()),
                    timed_out: true,
                    duration: started.elapsed(),
                };
            }
        },
        None => future.await,
    };

    match outcome {
        Ok(()) => HookResult {
            hook_id,
            name,
            success: true,
            error: None,
            timed_out: false,
            duration: started.elapsed(),
        },
        Err(message) => HookResult {
            hook_id,
            name,
            success: false,
            error: Some(message),
            timed_out: false,
            duration: started.elapsed(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[tokio::test]
    async fn dispatch_runs_registered_hooks_in_priority_order() {
        let dispatcher = HookDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        dispatcher.on(
            EventKind::EntityCreated,
            HookOptions { priority: 1, ..HookOptions::default() },
            move |_event| {
                let order = Arc::clone(&order_a);
                async move {
                    order.lock().unwrap().push("low");
                    Ok(())
                }
            },
        );
        let order_b = Arc::clone(&order);
        dispatcher.on(
            EventKind::EntityCreated,
            HookOptions { priority: 10, ..HookOptions::default() },
            move |_event| {
                let order = Arc::clone(&order_b);
                async move {
                    order.lock().unwrap().push("high");
                    Ok(())
                }
            },
        );

        let entity_id = EntityId::generate().unwrap();
        dispatcher.dispatch(HookEvent::EntityCreated { entity_id }).await;

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn failing_hook_with_continue_on_error_still_runs_siblings() {
        let dispatcher = HookDispatcher::new();

        dispatcher.on(
            EventKind::EntityCreated,
            HookOptions { priority: 10, continue_on_error: true, ..HookOptions::default() },
            |_event| async { Err("boom".to_string()) },
        );
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        dispatcher.on(
            EventKind::EntityCreated,
            HookOptions { priority: 1, continue_on_error: true, ..HookOptions::default() },
            move |_event| {
                let ran = Arc::clone(&ran_clone);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        let entity_id = EntityId::generate().unwrap();
        let result = dispatcher.dispatch(HookEvent::EntityCreated { entity_id }).await;

        assert_eq!(result.total_hooks, 2);
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_on_error_skips_lower_priority_sync_hooks() {
        let dispatcher = HookDispatcher::new();

        dispatcher.on(
            EventKind::EntityCreated,
            HookOptions { priority: 10, continue_on_error: false, ..HookOptions::default() },
            |_event| async { Err("boom".to_string()) },
        );
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        dispatcher.on(
            EventKind::EntityCreated,
            HookOptions { priority: 1, ..HookOptions::default() },
            move |_event| {
                let ran = Arc::clone(&ran_clone);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        let entity_id = EntityId::generate().unwrap();
        let result = dispatcher.dispatch(HookEvent::EntityCreated { entity_id }).await;

        assert_eq!(result.total_hooks, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn component_targeted_hook_ignores_other_types() {
        let dispatcher = HookDispatcher::new();
        let wanted = TypeId::derive_from_name("Profile");
        let other = TypeId::derive_from_name("Settings");

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        dispatcher.on_component(EventKind::ComponentAdded, wanted, HookOptions::default(), move |_event| {
            let ran = Arc::clone(&ran_clone);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let entity_id = EntityId::generate().unwrap();
        dispatcher
            .dispatch(HookEvent::ComponentAdded { entity_id, type_id: other })
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        dispatcher
            .dispatch(HookEvent::ComponentAdded { entity_id, type_id: wanted })
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hook_timeout_is_recorded_as_failure() {
        let dispatcher = HookDispatcher::new();
        dispatcher.on(
            EventKind::EntityCreated,
            HookOptions { timeout: Some(Duration::from_millis(5)), ..HookOptions::default() },
            |_event| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        );

        let entity_id = EntityId::generate().unwrap();
        let result = dispatcher.dispatch(HookEvent::EntityCreated { entity_id }).await;

        assert_eq!(result.failed, 1);
        assert!(result.per_hook_results[0].timed_out);
    }

    #[test]
    fn stats_start_empty() {
        let dispatcher = HookDispatcher::new();
        let snapshot = dispatcher.stats(EventKind::EntityCreated);
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.error_rate, 0.0);
    }
}

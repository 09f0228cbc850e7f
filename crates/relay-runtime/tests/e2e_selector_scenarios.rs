#![forbid(unsafe_code)]

//! End-to-end scenarios across store, selectors, mounts and stacks.
//!
//! Validates that:
//! 1. Publishing an equal tuple twice broadcasts at most once.
//! 2. Mutating a middle contribution recomputes only the suffix.
//! 3. Selectors registered in one pass are notified most-derived first.
//! 4. Reading a provider before its first update fails, then succeeds.
//! 5. Unsubscribing twice is harmless to everyone else.
//! 6. The basic subscribe/update scenario notifies exactly once.
//! 7. Extended hooks inherit equality gating from their root.
//! 8. A commit landing between a consumer's render and its subscription
//!    flush still reaches that consumer.

use relay_core::{ContextError, EqualityFn, Scheduler};
use relay_runtime::{
    Deps, Mount, ProviderHandle, ProviderStore, RenderCx, SelectorHook, StackComposer, Stacked,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

// ============================================================================
// Helpers
// ============================================================================

type Log = Rc<RefCell<Vec<String>>>;

/// A mount whose re-renders append `name` to `log`.
fn logging_mount(scheduler: &Scheduler, log: &Log, name: &str) -> Mount {
    let log = Rc::clone(log);
    let name = name.to_string();
    Mount::new(scheduler, move || log.borrow_mut().push(name.clone()))
}

fn counting_mount(scheduler: &Scheduler) -> (Mount, Rc<Cell<u32>>) {
    let renders = Rc::new(Cell::new(0));
    let renders_cb = Rc::clone(&renders);
    let mount = Mount::new(scheduler, move || renders_cb.set(renders_cb.get() + 1));
    (mount, renders)
}

fn render<'a, R>(mount: &'a Mount, provider: &'a ProviderHandle<R>) -> RenderCx<'a, R> {
    mount.begin_render();
    RenderCx::new(mount, provider)
}

fn notify_counter<D: Clone + PartialEq + 'static>(
    handle: &ProviderHandle<D>,
) -> (Rc<RefCell<Vec<D>>>, relay_runtime::Subscription) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_cb = Rc::clone(&seen);
    let sub = handle
        .subscribe(move |value: &D| seen_cb.borrow_mut().push(value.clone()), None)
        .expect("live provider");
    (seen, sub)
}

// ============================================================================
// 1. Equality gating
// ============================================================================

#[test]
fn equal_tuple_broadcasts_at_most_once() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32, String, bool)> = ProviderStore::new(&scheduler);
    let handle = store.register_provider();
    handle.update_value((0, String::new(), false)).expect("live");
    let (seen, _sub) = notify_counter(&handle);

    let tuples = [
        (1, "a".to_string(), true),
        (1, "b".to_string(), true),
        (2, "b".to_string(), false),
        (2, "b".to_string(), false),
    ];
    let mut expected = 0;
    let mut previous = (0, String::new(), false);
    for tuple in tuples {
        if tuple != previous {
            expected += 1;
        }
        handle.update_value(tuple.clone()).expect("live");
        handle.update_value(tuple.clone()).expect("live");
        previous = tuple;
    }
    assert_eq!(seen.borrow().len(), expected);
}

// ============================================================================
// 2. Suffix-only recomputation
// ============================================================================

#[test]
fn middle_mutation_recomputes_only_the_suffix() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<Stacked<Vec<&'static str>>> = ProviderStore::new(&scheduler);
    let stack = StackComposer::new(store.register_provider(), vec!["root"]).expect("live");

    let append = |tag: &&'static str, prev: &Vec<&'static str>| {
        let mut next = prev.clone();
        next.push(*tag);
        next
    };
    let zero = stack.insert_transform_at(0, "zero", append);
    let one = stack.insert_transform_at(1, "one", append);
    let two = stack.insert_transform_at(2, "two", append);
    assert_eq!(*stack.value(), vec!["root", "zero", "one", "two"]);

    let zero_before = stack.cached_value(zero.key()).expect("cached");
    let one_before = stack.cached_value(one.key()).expect("cached");
    let two_before = stack.cached_value(two.key()).expect("cached");
    let steps_before = stack.stats().steps_evaluated;

    one.set_input("ONE");
    assert_eq!(*stack.value(), vec!["root", "zero", "ONE", "two"]);

    assert!(Rc::ptr_eq(&zero_before, &stack.cached_value(zero.key()).expect("cached")));
    assert!(!Rc::ptr_eq(&one_before, &stack.cached_value(one.key()).expect("cached")));
    assert!(!Rc::ptr_eq(&two_before, &stack.cached_value(two.key()).expect("cached")));
    assert_eq!(stack.stats().steps_evaluated - steps_before, 2);
}

#[test]
fn stacked_value_reaches_selector_consumers() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<Stacked<i64>> = ProviderStore::new(&scheduler);
    let stack = StackComposer::new(store.register_provider(), 10).expect("live");
    let provider = stack.provider().clone();

    let hook: SelectorHook<Stacked<i64>> = SelectorHook::new();
    let plain = hook.extend_hook(|(value,): &Stacked<i64>| **value);
    let (mount, renders) = counting_mount(&scheduler);
    assert_eq!(plain.get(render(&mount, &provider)).expect("read"), 10);
    scheduler.flush();

    let bump = stack.push_transform(5, |add: &i64, prev: &i64| prev + add);
    scheduler.flush();
    assert_eq!(renders.get(), 1);
    assert_eq!(plain.get(render(&mount, &provider)).expect("read"), 15);

    bump.set_input(5);
    scheduler.flush();
    assert_eq!(renders.get(), 1);
}

// ============================================================================
// 3. Reverse-batched registration
// ============================================================================

#[test]
fn derived_selector_is_notified_before_its_root() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((1,)).expect("live");

    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let root: SelectorHook<(i32,)> = SelectorHook::new().with_label("root");
    let derived = root.extend_hook(|(x,): &(i32,)| x + 1).with_label("derived");

    // Same synchronous pass: the root consumer renders, then the derived one.
    let root_mount = logging_mount(&scheduler, &log, "root");
    let derived_mount = logging_mount(&scheduler, &log, "derived");
    root.get(render(&root_mount, &provider)).expect("read");
    derived.get(render(&derived_mount, &provider)).expect("read");
    scheduler.flush();
    assert_eq!(store.subscriber_count(provider.id()), 2);

    provider.update_value((2,)).expect("live");
    scheduler.flush();
    assert_eq!(*log.borrow(), vec!["derived", "root"]);
}

#[test]
fn deferred_registrations_flush_in_reverse() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(u8,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((0,)).expect("live");

    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let mut subs = Vec::new();
    for name in ["a", "b", "c"] {
        let log = Rc::clone(&log);
        subs.push(
            provider
                .subscribe_deferred_reversed(move |_| log.borrow_mut().push(name.into()), Some(name))
                .expect("live"),
        );
    }
    scheduler.flush();
    provider.update_value((1,)).expect("live");
    assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
}

// ============================================================================
// 4. Uninitialized read
// ============================================================================

#[test]
fn fresh_provider_is_uninitialized_until_updated() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32, char)> = ProviderStore::new(&scheduler);
    let handle = store.register_provider();

    let err = handle.latest_value().expect_err("no value yet");
    assert!(matches!(err, ContextError::UninitializedAccess { .. }));
    assert!(err.is_structural());

    handle.update_value((3, 'x')).expect("live");
    assert_eq!(handle.latest_value().expect("set"), (3, 'x'));
}

#[test]
fn missing_default_is_reported() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let hook: SelectorHook<(i32,)> = SelectorHook::new();
    let (mount, _) = counting_mount(&scheduler);
    let default = store.default_provider();
    let err = hook.get(render(&mount, &default)).expect_err("no default");
    assert!(matches!(err, ContextError::MissingDefaultValue));
}

// ============================================================================
// 5. Idempotent unsubscribe
// ============================================================================

#[test]
fn double_unsubscribe_leaves_others_alone() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let handle = store.register_provider();
    handle.update_value((0,)).expect("live");

    let (first, first_sub) = notify_counter(&handle);
    let (second, _second_sub) = notify_counter(&handle);
    first_sub.unsubscribe();
    first_sub.unsubscribe();
    drop(first_sub);

    handle.update_value((1,)).expect("live");
    assert!(first.borrow().is_empty());
    assert_eq!(*second.borrow(), vec![(1,)]);
}

// ============================================================================
// 6. End-to-end scenario
// ============================================================================

#[test]
fn register_update_subscribe_update() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let h1 = store.register_provider();

    h1.update_value((1,)).expect("live");
    let (seen, _sub) = notify_counter(&h1);
    assert!(seen.borrow().is_empty());

    h1.update_value((2,)).expect("live");
    assert_eq!(*seen.borrow(), vec![(2,)]);

    h1.update_value((2,)).expect("live");
    assert_eq!(*seen.borrow(), vec![(2,)]);
}

// ============================================================================
// 7. Extend chain
// ============================================================================

#[test]
fn extended_hook_gates_on_projected_equality() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((1,)).expect("live");

    let root: SelectorHook<(i32,)> = SelectorHook::new();
    let h2 = root.extend_hook(|(x,): &(i32,)| (x * 2,));
    let (mount, renders) = counting_mount(&scheduler);
    assert_eq!(h2.get(render(&mount, &provider)).expect("read"), (2,));
    scheduler.flush();

    provider.update_value((5,)).expect("live");
    scheduler.flush();
    assert_eq!(renders.get(), 1);
    assert_eq!(h2.get(render(&mount, &provider)).expect("read"), (10,));

    provider.update_value((5,)).expect("live");
    scheduler.flush();
    assert_eq!(renders.get(), 1);

    provider.update_value((6,)).expect("live");
    scheduler.flush();
    assert_eq!(renders.get(), 2);
    assert_eq!(h2.get(render(&mount, &provider)).expect("read"), (12,));
}

#[test]
fn extend_chain_follows_root_equality_changes() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((1,)).expect("live");

    let root: SelectorHook<(i32,)> = SelectorHook::new();
    let tens = root.extend_hook(|(x,): &(i32,)| *x);
    let grand = tens.extend_hook(|x: &i32| *x);
    assert!(grand.equality_fn_info().is_default);

    root.set_equality_fn(EqualityFn::custom(|a: &i32, b: &i32| a / 10 == b / 10));
    assert!(!grand.equality_fn_info().is_default);

    let (mount, renders) = counting_mount(&scheduler);
    grand.get(render(&mount, &provider)).expect("read");
    scheduler.flush();

    provider.update_value((9,)).expect("live");
    scheduler.flush();
    assert_eq!(renders.get(), 0);

    provider.update_value((12,)).expect("live");
    scheduler.flush();
    assert_eq!(renders.get(), 1);
}

// ============================================================================
// Two-phase commit and teardown
// ============================================================================

#[test]
fn temp_value_is_readable_in_the_same_pass() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((1,)).expect("live");

    let hook: SelectorHook<(i32,)> = SelectorHook::new();
    let (mount, renders) = counting_mount(&scheduler);
    hook.get(render(&mount, &provider)).expect("read");
    scheduler.flush();

    provider.use_update_value((2,)).expect("live");
    assert_eq!(hook.get(render(&mount, &provider)).expect("temp read"), (2,));
    assert_eq!(renders.get(), 0);

    store.commit_pending().expect("commit");
    scheduler.flush();
    // The consumer already rendered the committed value.
    assert_eq!(renders.get(), 0);
    assert!(scheduler.is_idle());
}

#[test]
fn remount_within_a_turn_keeps_consumer_state() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((4,)).expect("live");

    let hook: SelectorHook<(i32,)> = SelectorHook::new();
    let (mount, _) = counting_mount(&scheduler);
    hook.get(render(&mount, &provider)).expect("read");
    scheduler.flush();

    provider.destroy();
    assert!(provider.restore());
    scheduler.end_turn();

    assert_eq!(hook.get(render(&mount, &provider)).expect("read"), (4,));
    assert_eq!(store.subscriber_count(provider.id()), 1);
}

#[test]
fn destroyed_provider_fails_reads_after_purge() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((4,)).expect("live");

    provider.destroy();
    scheduler.end_turn();
    let hook: SelectorHook<(i32,)> = SelectorHook::new();
    let (mount, _) = counting_mount(&scheduler);
    let err = hook.get(render(&mount, &provider)).expect_err("purged");
    assert!(matches!(err, ContextError::ProviderDestroyed { .. }));
}

#[test]
fn memoized_select_skips_projection_until_deps_change() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(Vec<i32>,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((vec![1, 2, 3],)).expect("live");

    let calls = Rc::new(Cell::new(0));
    let hook: SelectorHook<(Vec<i32>,)> = SelectorHook::new();
    let (mount, _) = counting_mount(&scheduler);
    let read = |key: u32| {
        let calls = Rc::clone(&calls);
        hook.select(
            render(&mount, &provider),
            move |(items,): &(Vec<i32>,)| {
                calls.set(calls.get() + 1);
                items.iter().sum::<i32>()
            },
            Deps::of(key),
        )
        .expect("read")
    };

    assert_eq!(read(1), 6);
    assert_eq!(read(1), 6);
    assert_eq!(calls.get(), 1);
    assert_eq!(read(2), 6);
    assert_eq!(calls.get(), 2);
}

// ============================================================================
// 8. Commits between render and subscription flush
// ============================================================================

#[test]
fn update_between_render_and_flush_rerenders_consumer() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((1,)).expect("live");

    let hook: SelectorHook<(i32,)> = SelectorHook::new();
    let (mount, renders) = counting_mount(&scheduler);
    assert_eq!(hook.get(render(&mount, &provider)).expect("read"), (1,));

    provider.update_value((2,)).expect("live");
    scheduler.end_turn();
    assert_eq!(renders.get(), 1);
    assert_eq!(hook.get(render(&mount, &provider)).expect("read"), (2,));

    scheduler.end_turn();
    assert_eq!(renders.get(), 1);
}

#[test]
fn missed_commit_with_equal_projection_does_not_rerender() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32, &'static str)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((1, "a")).expect("live");

    let hook: SelectorHook<(i32, &'static str)> = SelectorHook::new();
    let (mount, renders) = counting_mount(&scheduler);
    let first = hook
        .select(render(&mount, &provider), |(n, _): &(i32, &'static str)| *n, Deps::none())
        .expect("read");
    assert_eq!(first, 1);

    provider.update_value((1, "b")).expect("live");
    scheduler.end_turn();
    assert_eq!(renders.get(), 0);
}

#[test]
fn stack_publish_between_renders_reaches_every_consumer() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<Stacked<i64>> = ProviderStore::new(&scheduler);
    let stack = StackComposer::new(store.register_provider(), 1).expect("live");
    let provider = stack.provider().clone();
    let hook: SelectorHook<Stacked<i64>> = SelectorHook::new();
    let plain = hook.extend_hook(|(value,): &Stacked<i64>| **value);

    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let first = logging_mount(&scheduler, &log, "first");
    let second = logging_mount(&scheduler, &log, "second");
    assert_eq!(plain.get(render(&first, &provider)).expect("read"), 1);
    let _top = stack.push(7);
    assert_eq!(plain.get(render(&second, &provider)).expect("read"), 1);

    scheduler.flush();
    let mut rerendered = log.borrow().clone();
    rerendered.sort();
    assert_eq!(rerendered, vec!["first", "second"]);
    assert_eq!(plain.get(render(&first, &provider)).expect("read"), 7);
}

#[test]
fn use_update_before_flush_catches_up_at_commit() {
    let scheduler = Scheduler::new();
    let store: ProviderStore<(i32,)> = ProviderStore::new(&scheduler);
    let provider = store.register_provider();
    provider.update_value((1,)).expect("live");
    provider.use_update_value((5,)).expect("live");

    let hook: SelectorHook<(i32,)> = SelectorHook::new();
    let (mount, renders) = counting_mount(&scheduler);
    assert_eq!(hook.get(render(&mount, &provider)).expect("read"), (5,));

    scheduler.end_turn();
    // The commit ran before the subscription joined; the replayed value is
    // the one the consumer already rendered.
    assert_eq!(renders.get(), 0);
    assert_eq!(store.version(provider.id()), 1);
}

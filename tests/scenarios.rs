use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use shikumi::{
    ArrayId, BufferRegion, Config, DataError, DeviceClass, JoinError, Movement, Placement,
    Runtime, SpawnError, TaskFailure, TaskHandle, TaskSpace, TaskState,
};
use static_assertions::assert_impl_all;

assert_impl_all!(Runtime: Send, Sync);
assert_impl_all!(TaskHandle: Send, Sync, Clone);
assert_impl_all!(TaskSpace: Send, Sync, Clone);
assert_impl_all!(JoinError: Send, Sync, std::error::Error);
assert_impl_all!(SpawnError: Send, Sync, std::error::Error);

const DEADLINE: Duration = Duration::from_secs(10);

fn runtime(cpus: usize) -> Runtime {
    Runtime::new(Config::default().cpus(cpus).report_timing(false)).unwrap()
}

/// Spins until `flag` is set, giving up at the deadline.
fn wait_for(flag: &AtomicBool) -> bool {
    let start = Instant::now();
    while !flag.load(Ordering::SeqCst) {
        if start.elapsed() > DEADLINE {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn chain_runs_in_order() {
    let runtime = runtime(3);
    let order = Arc::new(Mutex::new(Vec::new()));
    let space = TaskSpace::new("chain");

    runtime
        .join(|scope| {
            for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
                let order = Arc::clone(&order);
                scope
                    .task()
                    .id(&space.get(i).unwrap())
                    .depends_on(space.resolve(i.saturating_sub(1)..i))
                    .run(move |_| {
                        thread::sleep(Duration::from_millis(5));
                        order.lock().unwrap().push(name);
                        Ok(())
                    })
                    .unwrap();
            }
        })
        .unwrap();

    // the scope only closed after the last link finished
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(space.get(2).unwrap().state(), Some(TaskState::Completed));
}

#[test]
fn independent_tasks_run_concurrently() {
    let runtime = runtime(2);
    let flags = Arc::new([AtomicBool::new(false), AtomicBool::new(false)]);

    runtime
        .join(|scope| {
            for i in 0..2 {
                let flags = Arc::clone(&flags);
                scope
                    .task()
                    .run(move |_| {
                        flags[i].store(true, Ordering::SeqCst);
                        anyhow::ensure!(wait_for(&flags[1 - i]), "tasks were serialized");
                        Ok(())
                    })
                    .unwrap();
            }
        })
        .unwrap();
}

#[test]
fn dependency_on_unspawned_key_waits() {
    let runtime = runtime(2);
    let space = TaskSpace::new("late");
    let producer = space.get("producer").unwrap();
    let produced = Arc::new(AtomicBool::new(false));

    runtime
        .join(|scope| {
            let seen = Arc::clone(&produced);
            let consumer = scope
                .task()
                .name("consumer")
                .depends_on(&producer)
                .run(move |_| {
                    anyhow::ensure!(seen.load(Ordering::SeqCst), "ran before its producer");
                    Ok(())
                })
                .unwrap();

            thread::sleep(Duration::from_millis(50));
            assert_eq!(consumer.state(), Some(TaskState::Waiting));
            assert!(!producer.is_spawned());

            let done = Arc::clone(&produced);
            scope
                .task()
                .id(&producer)
                .run(move |_| {
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        })
        .unwrap();

    assert_eq!(producer.state(), Some(TaskState::Completed));
}

#[test]
fn failure_cascades_and_join_aggregates() {
    let runtime = runtime(2);
    let dependent_ran = Arc::new(AtomicBool::new(false));

    let err = runtime
        .join(|scope| {
            let a = scope
                .task()
                .name("a")
                .run(|_| anyhow::bail!("boom"))
                .unwrap();

            let ran = Arc::clone(&dependent_ran);
            let b = scope
                .task()
                .name("b")
                .depends_on(&a)
                .run(move |_| {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();

            scope.task().name("c").depends_on(&b).run(|_| Ok(())).unwrap();
            scope.task().name("unrelated").run(|_| Ok(())).unwrap();
        })
        .unwrap_err();

    assert!(!dependent_ran.load(Ordering::SeqCst));
    assert_eq!(err.failures.len(), 3);

    let roots: Vec<_> = err.roots().collect();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].name(), "a");
    assert!(roots[0].to_string().contains("boom"));

    for failure in err.failures.iter().filter(|f| f.is_cascaded()) {
        assert_eq!(failure.root().name(), "a");
    }

    assert!(err.to_string().contains("3 task(s) failed"));
}

#[test]
fn already_failed_predecessor_fails_new_dependent() {
    let runtime = runtime(1);

    let mut failed = None;
    let err = runtime
        .join(|scope| {
            failed = Some(scope.task().name("root").run(|_| anyhow::bail!("nope")).unwrap());
        })
        .unwrap_err();
    assert_eq!(err.failures.len(), 1);

    let failed = failed.unwrap();
    assert_eq!(failed.state(), Some(TaskState::Failed));

    let err = runtime
        .join(|scope| {
            scope.task().name("late").depends_on(&failed).run(|_| Ok(())).unwrap();
        })
        .unwrap_err();

    match &err.failures[..] {
        [TaskFailure::Cascaded { name, origin, .. }] => {
            assert_eq!(name, "late");
            assert_eq!(origin.name(), "root");
        }
        other => panic!("unexpected failures: {other:?}"),
    }
}

#[test]
fn panicking_body_becomes_failure() {
    let runtime = runtime(1);

    let err = runtime
        .join(|scope| {
            scope.task().name("panics").run(|_| panic!("kaboom")).unwrap();
        })
        .unwrap_err();

    assert!(err.failures[0].to_string().contains("Task panicked: kaboom"));

    // the worker survived
    let (_, report) = runtime
        .join_report(|scope| {
            scope.task().run(|_| Ok(())).unwrap();
        })
        .unwrap();
    assert_eq!(report.completed, 1);
}

#[test]
fn join_observes_every_completion() {
    let runtime = runtime(4);
    let space = TaskSpace::new("fan");
    let counter = Arc::new(AtomicUsize::new(0));
    let n = 200;

    let (_, report) = runtime
        .join_report(|scope| {
            for i in 0..n {
                let counter = Arc::clone(&counter);
                scope
                    .task()
                    .id(&space.get(i).unwrap())
                    .depends_on(space.resolve((i / 2)..(i / 2 + (i % 3).min(i - i / 2))))
                    .run(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
            }
        })
        .unwrap();

    assert_eq!(report.completed, n);
    assert_eq!(counter.load(Ordering::SeqCst), n);
}

#[test]
fn duplicate_spawn_is_rejected() {
    let runtime = runtime(1);
    let space = TaskSpace::new("dup");
    let handle = space.get((1, 1)).unwrap();

    runtime
        .join(|scope| {
            scope.task().id(&handle).run(|_| Ok(())).unwrap();

            let again = scope.task().id(&space.get((1, 1)).unwrap()).run(|_| Ok(()));
            assert!(matches!(again, Err(SpawnError::DuplicateSpawn { task }) if task == "dup[1, 1]"));
        })
        .unwrap();
}

#[test]
fn invalid_placement_is_rejected() {
    let runtime = Runtime::new(
        Config::default()
            .cpus(1)
            .cpu_memory(1024)
            .report_timing(false),
    )
    .unwrap();

    let gpu = runtime.task().placement(DeviceClass::Gpu).run(|_| Ok(()));
    assert!(matches!(gpu, Err(SpawnError::InvalidPlacement(_))));

    let big = runtime.task().footprint(4096).run(|_| Ok(()));
    assert!(matches!(big, Err(SpawnError::InvalidPlacement(_))));

    let region = BufferRegion::new(ArrayId(0), 0..2048);
    let implied = runtime.task().reads(region).run(|_| Ok(()));
    assert!(matches!(implied, Err(SpawnError::InvalidPlacement(_))));
}

#[test]
fn cycles_are_rejected() {
    let runtime = runtime(1);
    let space = TaskSpace::new("cycle");
    let (a, b) = (space.get(0).unwrap(), space.get(1).unwrap());

    // `a` never becomes ready, so it stays outside of any join scope
    runtime.task().id(&a).depends_on(&b).run(|_| Ok(())).unwrap();

    let closing = runtime.task().id(&b).depends_on(&a).run(|_| Ok(()));
    assert!(matches!(closing, Err(SpawnError::DependencyCycle { .. })));
    assert!(!b.is_spawned());

    let c = space.get(2).unwrap();
    let selfish = runtime.task().id(&c).depends_on(&c).run(|_| Ok(()));
    assert!(matches!(selfish, Err(SpawnError::DependencyCycle { .. })));
}

#[test]
fn data_round_trips_across_devices() {
    let runtime = runtime(3);
    let ids: Vec<_> = runtime.devices().iter().map(|d| d.id).collect();
    let region = BufferRegion::new(ArrayId(7), 0..4);
    let space = TaskSpace::new("rt");

    runtime.place(&region, ids[0], &[1, 2, 3, 4]).unwrap();

    runtime
        .join(|scope| {
            scope
                .task()
                .id(&space.get(0).unwrap())
                .on(ids[1])
                .updates(region)
                .run(move |ctx| {
                    let mut bytes = ctx.read(&region)?;
                    bytes.iter_mut().for_each(|b| *b *= 10);
                    ctx.write(&region, &bytes)?;
                    Ok(())
                })
                .unwrap();

            scope
                .task()
                .id(&space.get(1).unwrap())
                .depends_on(space.get(0).unwrap())
                .on(ids[2])
                .reads(region)
                .run(move |ctx| {
                    anyhow::ensure!(ctx.read(&region)? == vec![10, 20, 30, 40]);
                    Ok(())
                })
                .unwrap();
        })
        .unwrap();

    let tracker = runtime.tracker();
    assert_eq!(tracker.canonical(&region), Some(ids[1]));
    assert_eq!(tracker.holders(&region), vec![ids[1], ids[2]]);
    assert_eq!(runtime.read(&region).unwrap(), vec![10, 20, 30, 40]);
    assert_eq!(space.get(0).unwrap().device(), Some(ids[1]));
}

#[test]
fn manual_movement_is_left_to_the_body() {
    let runtime = Runtime::new(
        Config::default()
            .cpus(2)
            .movement(Movement::Manual)
            .report_timing(false),
    )
    .unwrap();
    let ids: Vec<_> = runtime.devices().iter().map(|d| d.id).collect();
    let region = BufferRegion::new(ArrayId(8), 0..2);
    runtime.place(&region, ids[0], &[5, 6]).unwrap();

    let err = runtime
        .join(|scope| {
            scope
                .task()
                .name("forgetful")
                .on(ids[1])
                .reads(region)
                .run(move |ctx| {
                    ctx.read(&region)?;
                    Ok(())
                })
                .unwrap();
        })
        .unwrap_err();

    let TaskFailure::Body { error, .. } = &err.failures[0] else {
        panic!("expected a body failure");
    };
    assert!(matches!(
        error.downcast_ref::<DataError>(),
        Some(DataError::NotResident { .. })
    ));

    runtime
        .join(|scope| {
            scope
                .task()
                .name("careful")
                .on(ids[1])
                .reads(region)
                .run(move |ctx| {
                    ctx.ensure_resident(&region)?;
                    anyhow::ensure!(ctx.read(&region)? == vec![5, 6]);
                    Ok(())
                })
                .unwrap();

            // automatic for this task only
            scope
                .task()
                .name("override")
                .on(ids[1])
                .movement(Movement::Automatic)
                .reads(region)
                .run(move |ctx| {
                    anyhow::ensure!(ctx.read(&region)? == vec![5, 6]);
                    Ok(())
                })
                .unwrap();
        })
        .unwrap();
}

#[test]
fn ready_task_prefers_its_data() {
    let runtime = runtime(4);
    let home = runtime.devices()[2].id;
    let regions = [
        BufferRegion::new(ArrayId(9), 0..8),
        BufferRegion::new(ArrayId(9), 8..16),
    ];

    for region in &regions {
        runtime.place(region, home, &[0; 8]).unwrap();
    }

    let handle = runtime
        .join(|scope| {
            scope
                .task()
                .reads(regions[0])
                .reads(regions[1])
                .run(|_| Ok(()))
                .unwrap()
        })
        .unwrap();

    assert_eq!(handle.device(), Some(home));
    assert_eq!(runtime.diagnostics().movement.copies, 0);
}

#[test]
fn near_placement_follows_the_data() {
    let runtime = runtime(3);
    let home = runtime.devices()[1].id;
    let region = BufferRegion::new(ArrayId(10), 0..4);
    runtime.place(&region, home, &[1; 4]).unwrap();

    let handle = runtime
        .join(|scope| {
            scope
                .task()
                .placement(Placement::Near(vec![region]))
                .run(|_| Ok(()))
                .unwrap()
        })
        .unwrap();

    assert_eq!(handle.device(), Some(home));
}

#[test]
fn bodies_can_spawn_and_join_on_a_single_device() {
    let runtime = runtime(1);
    let counter = Arc::new(AtomicUsize::new(0));

    runtime
        .join(|scope| {
            let counter = Arc::clone(&counter);
            scope
                .task()
                .name("parent")
                .run(move |ctx| {
                    ctx.join(|inner| {
                        for _ in 0..5 {
                            let counter = Arc::clone(&counter);
                            inner
                                .task()
                                .run(move |_| {
                                    counter.fetch_add(1, Ordering::SeqCst);
                                    Ok(())
                                })
                                .unwrap();
                        }
                    })?;

                    anyhow::ensure!(counter.load(Ordering::SeqCst) == 5);
                    Ok(())
                })
                .unwrap();
        })
        .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[test]
fn many_joining_siblings_on_a_single_device() {
    let runtime = runtime(1);
    let children = Arc::new(AtomicUsize::new(0));
    let n = 3000;

    let (_, report) = runtime
        .join_report(|scope| {
            for _ in 0..n {
                let children = Arc::clone(&children);
                scope
                    .task()
                    .run(move |ctx| {
                        ctx.join(|inner| {
                            inner
                                .task()
                                .run(move |_| {
                                    children.fetch_add(1, Ordering::SeqCst);
                                    Ok(())
                                })
                                .unwrap();
                        })?;
                        Ok(())
                    })
                    .unwrap();
            }
        })
        .unwrap();

    assert_eq!(report.completed, n);
    assert_eq!(children.load(Ordering::SeqCst), n);
}

#[test]
fn dropping_the_runtime_releases_a_body_inside_join() {
    let runtime = runtime(1);
    let space = TaskSpace::new("never");
    let missing = space.get(0).unwrap();
    let entered = Arc::new(AtomicBool::new(false));
    let (outcome_tx, outcome_rx) = mpsc::channel();

    let flag = Arc::clone(&entered);
    runtime
        .task()
        .name("outer")
        .run(move |ctx| {
            let result = ctx.join(|scope| {
                scope.task().depends_on(&missing).run(|_| Ok(())).unwrap();
                flag.store(true, Ordering::SeqCst);
            });
            let _ = outcome_tx.send(result.map_err(|err| err.abandoned));
            Ok(())
        })
        .unwrap();

    assert!(wait_for(&entered));

    let (dropped_tx, dropped_rx) = mpsc::channel();
    thread::spawn(move || {
        drop(runtime);
        let _ = dropped_tx.send(());
    });

    assert!(
        dropped_rx.recv_timeout(DEADLINE).is_ok(),
        "dropping the runtime did not return"
    );
    assert_eq!(outcome_rx.recv_timeout(DEADLINE).unwrap(), Err(1));
}

#[test]
fn nested_scopes_close_inside_out() {
    let runtime = runtime(2);
    let done = Arc::new(AtomicUsize::new(0));

    runtime
        .join(|outer| {
            let seen = outer
                .join(|inner| {
                    assert_eq!(inner.depth(), 1);
                    let done = Arc::clone(&done);
                    inner
                        .task()
                        .run(move |_| {
                            thread::sleep(Duration::from_millis(20));
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
                .map(|_| done.load(Ordering::SeqCst));

            assert_eq!(seen.unwrap(), 1);
        })
        .unwrap();
}

#[test]
fn diagnostics_cover_the_graph() {
    let runtime = runtime(2);
    let space = TaskSpace::new("diag");

    runtime
        .join(|scope| {
            scope.task().id(&space.get(0).unwrap()).run(|_| Ok(())).unwrap();
            scope
                .task()
                .id(&space.get(1).unwrap())
                .depends_on(space.get(0).unwrap())
                .run(|_| Ok(()))
                .unwrap();
        })
        .unwrap();

    let diagnostics = runtime.diagnostics();
    assert_eq!(diagnostics.records.len(), 2);
    assert_eq!(diagnostics.edge_count(), 1);

    let first = diagnostics.record(space.get(0).unwrap().id()).unwrap();
    assert_eq!(first.state, TaskState::Completed);

    let mermaid = diagnostics.render_mermaid();
    assert!(mermaid.contains("diag[0]"));
    assert!(mermaid.contains("diag[1]"));

    let json = diagnostics.to_json().unwrap();
    assert!(json.contains("\"name\": \"diag[1]\""));
}

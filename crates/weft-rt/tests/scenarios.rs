// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end scheduling scenarios driven through the worker loop.

mod common;

use std::cell::RefCell;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use common::{assert_tree_invariants, drain, worker, worker_with, Trace};
use weft_rt::{
    run_entry, ApiError, CoStatus, Func, Outcome, Pattern, Phase, RuntimeConfig, ScriptError,
    TcpSocket, Value,
};

fn sleeper(ms: u64, result: &'static str) -> Func {
    Func::new("sleeper", move |co, _| async move {
        co.sleep(Duration::from_millis(ms)).await?;
        Ok(vec![Value::from(result)])
    })
}

#[test]
fn socket_read_suspends_until_ready() {
    let worker = worker();
    let (ours, mut peer) = UnixStream::pair().unwrap();
    let slot = Rc::new(RefCell::new(Some(OwnedFd::from(ours))));

    let entry = Func::new("main", move |co, _| {
        let slot = slot.clone();
        async move {
            let fd = slot.borrow_mut().take().expect("entry runs once");
            let sock = TcpSocket::from_fd(&co, fd)?;
            let line = sock.receive(&co, Pattern::Line).await?;
            Ok(vec![Value::Bytes(line)])
        }
    });

    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    let entry_id = req.entry().unwrap();
    let snap = req.snapshot();
    assert_eq!(snap.len(), 1);
    assert!(snap[0].has_pending);
    assert_eq!(req.status(entry_id), CoStatus::Running);

    peer.write_all(b"hello\r\n").unwrap();
    drain(&worker);

    assert_eq!(req.outcome(), Some(Outcome::TreeDone));
    assert_eq!(req.results(), vec![Value::from("hello")]);
    assert!(worker.is_idle());
}

#[test]
fn wait_returns_in_wait_order() {
    let worker = worker();
    let entry = Func::new("main", |co, _| async move {
        let slow = co.spawn(sleeper(30, "one"), Vec::new()).await?;
        let fast = co.spawn(sleeper(5, "two"), Vec::new()).await?;
        let mut out = co.wait(&[slow]).await?;
        out.extend(co.wait(&[fast]).await?);
        Ok(out)
    });

    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    assert_eq!(req.live_user_threads(), 2);
    assert_tree_invariants(&req);

    drain(&worker);
    assert_eq!(req.outcome(), Some(Outcome::TreeDone));
    assert_eq!(
        req.results(),
        vec![
            Value::Bool(true),
            Value::from("one"),
            Value::Bool(true),
            Value::from("two"),
        ]
    );
    assert_eq!(req.live_user_threads(), 0);
}

#[test]
fn kill_cancels_blocked_thread() {
    let worker = worker();
    let seen = Trace::default();
    let trace = seen.clone();
    let entry = Func::new("main", move |co, _| {
        let trace = trace.clone();
        async move {
            let t = co.spawn(sleeper(10_000, "never"), Vec::new()).await?;
            let req = co.request()?;
            trace.push(format!("before {}", req.live_user_threads()));
            co.kill(t)?;
            trace.push(format!("after {}", req.live_user_threads()));
            trace.push(co.status(t).to_string());
            assert_eq!(co.kill(t), Err(ApiError::AlreadyWaited));
            Ok(Vec::new())
        }
    });

    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::TreeDone);
    assert_eq!(seen.entries(), vec!["before 1", "after 0", "dead"]);
    // The sleep timer went with the thread.
    assert!(worker.is_idle());
}

#[test]
fn kill_reclaims_coroutines_resumed_by_thread() {
    let worker = worker();
    let entry = Func::new("main", |co, _| async move {
        let resumer = Func::new("resumer", |co, _| async move {
            let lib = co.create(sleeper(20, "lib done"))?;
            co.resume(lib, Vec::new()).await?;
            Ok(Vec::new())
        });
        let t = co.spawn(resumer, Vec::new()).await?;
        let req = co.request()?;
        assert_eq!(req.snapshot().len(), 3);
        co.kill(t)?;
        let left: Vec<Value> = req
            .snapshot()
            .into_iter()
            .map(|c| Value::from(c.name))
            .collect();
        assert_tree_invariants(&req);
        drop(req);
        // Long enough for the library coroutine's timer, had it survived.
        co.sleep(Duration::from_millis(40)).await?;
        Ok(left)
    });

    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    drain(&worker);
    assert_eq!(req.outcome(), Some(Outcome::TreeDone));
    assert_eq!(req.results(), vec![Value::from("main")]);
}

#[test]
fn entry_fault_is_internal_error() {
    let worker = worker();
    let failing = || Func::new("main", |_co, _| async { Err(ScriptError::runtime("boom")) });

    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, failing(), Vec::new()), Outcome::Status(500));

    let req = worker.request(Phase::Content);
    req.mark_header_sent();
    assert_eq!(run_entry(&req, failing(), Vec::new()), Outcome::Error);
}

#[test]
fn entry_fault_after_suspension_releases_pending() {
    let worker = worker();
    let entry = Func::new("main", |co, _| async move {
        co.sleep(Duration::from_millis(1)).await?;
        let _t = co.spawn(sleeper(10_000, "never"), Vec::new()).await?;
        Err(ScriptError::runtime("late failure"))
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    drain(&worker);
    assert_eq!(req.outcome(), Some(Outcome::Status(500)));
    assert!(req.snapshot().is_empty());
    assert!(worker.is_idle());
}

#[test]
fn thread_yield_runs_posted_first() {
    let worker = worker();
    let seen = Trace::default();
    let (t1, t2) = (seen.clone(), seen.clone());

    let yielder = Func::new("yielder", move |co, _| {
        let trace = t1.clone();
        async move {
            trace.push("thread before yield");
            let got = co.yield_values(vec![Value::Int(1)]).await?;
            assert!(got.is_empty());
            trace.push("thread after yield");
            Ok(Vec::new())
        }
    });
    let entry = Func::new("main", move |co, _| {
        let trace = t2.clone();
        let yielder = yielder.clone();
        async move {
            co.spawn(yielder, Vec::new()).await?;
            trace.push("entry done");
            Ok(Vec::new())
        }
    });

    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::TreeDone);
    assert_eq!(
        seen.entries(),
        vec!["thread before yield", "entry done", "thread after yield"]
    );
}

#[test]
fn coroutine_resume_and_yield() {
    let worker = worker();
    let gen = Func::new("gen", |co, args| async move {
        let got = co.yield_values(vec![Value::Int(1)]).await?;
        co.yield_values(got).await?;
        Ok(args)
    });
    let entry = Func::new("main", move |co, _| {
        let gen = gen.clone();
        async move {
            let c = co.create(gen)?;
            assert_eq!(co.status(c), CoStatus::Suspended);
            let mut out = co.resume(c, vec![Value::from("start")]).await?;
            assert_eq!(co.status(c), CoStatus::Suspended);
            out.extend(co.resume(c, vec![Value::Int(2)]).await?);
            out.extend(co.resume(c, Vec::new()).await?);
            assert_eq!(co.status(c), CoStatus::Dead);
            assert_eq!(
                co.resume(c, Vec::new()).await,
                Err(ApiError::CannotResume(CoStatus::Dead))
            );
            Ok(out)
        }
    });

    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::TreeDone);
    assert_eq!(
        req.results(),
        vec![
            Value::Bool(true),
            Value::Int(1),
            Value::Bool(true),
            Value::Int(2),
            Value::Bool(true),
            Value::from("start"),
        ]
    );
}

#[test]
fn coroutine_fault_returns_to_resumer() {
    let worker = worker();
    let bad = Func::new("bad", |_co, _| async { Err(ScriptError::runtime("bad input")) });
    let entry = Func::new("main", move |co, _| {
        let bad = bad.clone();
        async move {
            let c = co.create(bad.clone())?;
            let mut out = co.resume(c, Vec::new()).await?;
            let w = co.wrap(bad)?;
            let err = w.call(&co, Vec::new()).await.unwrap_err();
            out.push(Value::from(err.message));
            Ok(out)
        }
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::TreeDone);
    assert_eq!(
        req.results(),
        vec![
            Value::Bool(false),
            Value::from("bad input"),
            Value::from("bad input"),
        ]
    );
}

#[test]
fn failed_thread_delivers_false_to_waiter() {
    let worker = worker();
    let failing = Func::new("failing", |co, _| async move {
        co.sleep(Duration::from_millis(1)).await?;
        Err(ScriptError::runtime("thread failed"))
    });
    let entry = Func::new("main", move |co, _| {
        let failing = failing.clone();
        async move {
            let t = co.spawn(failing, Vec::new()).await?;
            co.wait(&[t]).await.map_err(ScriptError::from)
        }
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    drain(&worker);
    assert_eq!(
        req.results(),
        vec![Value::Bool(false), Value::from("thread failed")]
    );
}

#[test]
fn wait_argument_errors() {
    let worker = worker();
    let entry = Func::new("main", |co, _| async move {
        assert_eq!(co.wait(&[]).await, Err(ApiError::NoThreads));
        let c = co.create(Func::new("lib", |_co, _| async { Ok(Vec::new()) }))?;
        assert_eq!(co.wait(&[c]).await, Err(ApiError::WaitNotUserThread));
        let t = co
            .spawn(Func::new("quick", |_co, _| async { Ok(vec![Value::Int(9)]) }), Vec::new())
            .await?;
        assert_eq!(co.status(t), CoStatus::Zombie);
        assert_eq!(co.wait(&[t]).await, Ok(vec![Value::Bool(true), Value::Int(9)]));
        assert_eq!(co.wait(&[t]).await, Err(ApiError::AlreadyWaited));
        Ok(Vec::new())
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::TreeDone);
}

#[test]
fn kill_zombie_reports_already_terminated() {
    let worker = worker();
    let entry = Func::new("main", |co, _| async move {
        let t = co
            .spawn(Func::new("quick", |_co, _| async { Ok(Vec::new()) }), Vec::new())
            .await?;
        assert_eq!(co.kill(t), Err(ApiError::AlreadyTerminated));
        assert_eq!(co.request()?.live_user_threads(), 0);
        Ok(Vec::new())
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::TreeDone);
}

#[test]
fn exit_exec_and_rewrite_jumps() {
    let worker = worker();
    let req = worker.request(Phase::Content);
    let exit = Func::new("main", |co, _| async move {
        co.exit(404).await?;
        unreachable!("exit does not return");
    });
    assert_eq!(run_entry(&req, exit, Vec::new()), Outcome::Status(404));

    let req = worker.request(Phase::Content);
    let exec = Func::new("main", |co, _| async move {
        co.exec("/internal", "a=1").await?;
        Ok(Vec::new())
    });
    assert_eq!(
        run_entry(&req, exec, Vec::new()),
        Outcome::Redirect {
            uri: "/internal".into(),
            args: "a=1".into()
        }
    );

    let req = worker.request(Phase::Rewrite);
    let rewrite = Func::new("main", |co, _| async move {
        co.rewrite("/new").await?;
        Ok(Vec::new())
    });
    assert_eq!(
        run_entry(&req, rewrite, Vec::new()),
        Outcome::Rewrite { uri: "/new".into() }
    );

    let req = worker.request(Phase::Content);
    let misplaced = Func::new("main", |co, _| async move {
        assert_eq!(co.rewrite("/new").await, Err(ApiError::NotYieldable("content")));
        Ok(Vec::new())
    });
    assert_eq!(run_entry(&req, misplaced, Vec::new()), Outcome::TreeDone);
}

#[test]
fn exit_from_thread_tears_down_tree() {
    let worker = worker();
    let quitter = Func::new("quitter", |co, _| async move {
        co.sleep(Duration::from_millis(1)).await?;
        co.exit(0).await?;
        Ok(Vec::new())
    });
    let entry = Func::new("main", move |co, _| {
        let quitter = quitter.clone();
        async move {
            co.spawn(quitter, Vec::new()).await?;
            co.sleep(Duration::from_secs(60)).await?;
            Ok(Vec::new())
        }
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    drain(&worker);
    assert_eq!(req.outcome(), Some(Outcome::TreeDone));
    assert!(req.snapshot().is_empty());
}

#[test]
fn yield_in_log_phase_is_rejected() {
    let worker = worker();
    let req = worker.request(Phase::Log);
    let entry = Func::new("log", |co, _| async move {
        let err = co.sleep(Duration::ZERO).await.unwrap_err();
        Ok(vec![Value::from(err.to_string())])
    });
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::TreeDone);
    assert_eq!(
        req.results(),
        vec![Value::from("API disabled in the context of log")]
    );
}

#[test]
fn client_abort_runs_handler() {
    let worker = worker_with(RuntimeConfig {
        check_client_abort: true,
        ..RuntimeConfig::default()
    });
    let seen = Trace::default();
    let trace = seen.clone();
    let entry = Func::new("main", move |co, _| {
        let trace = trace.clone();
        async move {
            let handler = Func::new("on_abort", move |co, _| {
                let trace = trace.clone();
                async move {
                    trace.push("aborted");
                    co.exit(444).await?;
                    Ok(Vec::new())
                }
            });
            co.on_abort(handler.clone())?;
            assert_eq!(co.on_abort(handler), Err(ApiError::DuplicateCall));
            co.sleep(Duration::from_secs(60)).await?;
            Ok(Vec::new())
        }
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    assert_eq!(req.client_aborted(), Outcome::Status(444));
    assert_eq!(seen.entries(), vec!["aborted"]);
    assert!(worker.is_idle());
    // Idempotent once torn down.
    assert_eq!(req.client_aborted(), Outcome::Status(444));
    req.cleanup();
}

#[test]
fn client_abort_without_handler() {
    let worker = worker();
    let entry = Func::new("main", |co, _| async move {
        assert_eq!(
            co.on_abort(Func::new("h", |_co, _| async { Ok(Vec::new()) })),
            Err(ApiError::ClientAbortDisabled)
        );
        co.sleep(Duration::from_secs(60)).await?;
        Ok(Vec::new())
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    assert_eq!(req.client_aborted(), Outcome::Status(499));
    assert!(req.is_destroyed());
    assert!(worker.is_idle());
}

#[test]
fn capture_collects_children_in_order() {
    let worker = worker();
    let entry = Func::new("main", |co, _| async move {
        let calls = vec![
            (sleeper(5, "slow"), Vec::new()),
            (
                Func::new("echo", |_co, args| async move { Ok(args) }),
                vec![Value::Int(3)],
            ),
            (
                Func::new("fail", |_co, _| async { Err(ScriptError::runtime("no")) }),
                Vec::new(),
            ),
        ];
        let captured = co.capture(calls).await?;
        let mut out = Vec::new();
        for c in captured {
            out.push(Value::from(format!("{:?}", c.outcome)));
            out.extend(c.values);
        }
        Ok(out)
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    drain(&worker);
    assert_eq!(req.outcome(), Some(Outcome::TreeDone));
    assert_eq!(
        req.results(),
        vec![
            Value::from("TreeDone"),
            Value::from("slow"),
            Value::from("TreeDone"),
            Value::Int(3),
            Value::from("Status(500)"),
        ]
    );
}

#[test]
fn kill_refuses_thread_with_subrequests() {
    let worker = worker();
    let fetcher = Func::new("fetcher", |co, _| async move {
        co.capture(vec![(sleeper(5, "x"), Vec::new())]).await?;
        Ok(Vec::new())
    });
    let entry = Func::new("main", move |co, _| {
        let fetcher = fetcher.clone();
        async move {
            let t = co.spawn(fetcher, Vec::new()).await?;
            assert_eq!(co.kill(t), Err(ApiError::PendingSubrequests));
            co.wait(&[t]).await?;
            Ok(Vec::new())
        }
    });
    let req = worker.request(Phase::Content);
    assert_eq!(run_entry(&req, entry, Vec::new()), Outcome::Suspend);
    drain(&worker);
    assert_eq!(req.outcome(), Some(Outcome::TreeDone));
}

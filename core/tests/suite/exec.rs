//! End-to-end exec scenarios against real host processes: a PTY-backed
//! interactive cat, a batch run with split stdout/stderr, and the
//! detached null-device path.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use futures::SinkExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use vessel_core::exec::ExecAction;
use vessel_core::exec::ExecSession;
use vessel_core::exec::exec_post;
use vessel_core::instance::Instance;
use vessel_protocol::CONTROL_FD;
use vessel_protocol::ExecPost;

use crate::suite::support::HostExec;
use crate::suite::support::READ_TIMEOUT;
use crate::suite::support::StubInstance;
use crate::suite::support::attach;
use crate::suite::support::collect_until_close;
use crate::suite::support::read_until_contains;

fn websocket_session(command: &[&str], interactive: bool) -> Arc<ExecSession> {
    crate::suite::support::init_logging();
    let instance = StubInstance::running("c1", Default::default());
    let action = exec_post(
        instance.as_ref() as &dyn Instance,
        Arc::new(HostExec),
        ExecPost {
            command: command.iter().map(|arg| arg.to_string()).collect(),
            environment: None,
            wait_for_websocket: true,
            interactive,
        },
    )
    .expect("exec POST should be accepted");
    match action {
        ExecAction::WaitForWebsocket(session) => session,
        ExecAction::Detached(_) => panic!("expected an advertised session"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interactive_cat_echoes_and_exits_cleanly() -> Result<()> {
    let session = websocket_session(&["/bin/cat"], true);
    let secrets = session.metadata().to_indexed();

    let run = tokio::spawn(Arc::clone(&session).run());

    let mut control = attach(&session, &secrets[&CONTROL_FD])
        .await
        .context("control attach failed")?;
    let mut stdio = attach(&session, &secrets[&0])
        .await
        .context("stdio attach failed")?;

    stdio
        .send(Message::Binary(b"hello\n".to_vec().into()))
        .await?;
    read_until_contains(&mut stdio, b"hello").await?;

    // A resize plus two malformed control messages; none of them may
    // disturb the session.
    control
        .send(Message::Text(
            json!({
                "command": "window-resize",
                "args": {"width": "80", "height": "24"}
            })
            .to_string()
            .into(),
        ))
        .await?;
    control.send(Message::Text("{not json".into())).await?;
    control
        .send(Message::Text(
            json!({
                "command": "window-resize",
                "args": {"width": "wide", "height": "24"}
            })
            .to_string()
            .into(),
        ))
        .await?;

    stdio
        .send(Message::Binary(b"again\n".to_vec().into()))
        .await?;
    read_until_contains(&mut stdio, b"again").await?;

    stdio.close(None).await?;
    let result = timeout(READ_TIMEOUT, run)
        .await
        .context("run did not finish after the stdio socket closed")?
        .context("run task panicked")?
        .context("run failed")?;
    assert_eq!(result.ret, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_run_splits_stdout_and_stderr() -> Result<()> {
    let session = websocket_session(&["/bin/sh", "-c", "echo out; echo err 1>&2"], false);
    let secrets = session.metadata().to_indexed();

    let run = tokio::spawn(Arc::clone(&session).run());

    // The control channel stays unattached: it is optional and its
    // absence must not stall the session.
    let _stdin = attach(&session, &secrets[&0]).await.context("attach 0")?;
    let mut stdout = attach(&session, &secrets[&1]).await.context("attach 1")?;
    let mut stderr = attach(&session, &secrets[&2]).await.context("attach 2")?;

    let out = collect_until_close(&mut stdout).await?;
    let err = collect_until_close(&mut stderr).await?;
    assert_eq!(out, b"out\n");
    assert_eq!(err, b"err\n");

    let result = timeout(READ_TIMEOUT, run)
        .await
        .context("run did not finish after the output drained")?
        .context("run task panicked")?
        .context("run failed")?;
    assert_eq!(result.ret, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_stdin_reaches_the_child() -> Result<()> {
    let session = websocket_session(&["/bin/cat"], false);
    let secrets = session.metadata().to_indexed();

    let run = tokio::spawn(Arc::clone(&session).run());

    let mut stdin = attach(&session, &secrets[&0]).await.context("attach 0")?;
    let mut stdout = attach(&session, &secrets[&1]).await.context("attach 1")?;
    let _stderr = attach(&session, &secrets[&2]).await.context("attach 2")?;

    stdin
        .send(Message::Binary(b"first\nsecond\n".to_vec().into()))
        .await?;
    // A zero-length payload is the logical EOF for stdin; cat exits once
    // its input ends.
    stdin.send(Message::Binary(Vec::new().into())).await?;

    let out = collect_until_close(&mut stdout).await?;
    assert_eq!(out, b"first\nsecond\n");

    let result = timeout(READ_TIMEOUT, run)
        .await
        .context("run did not finish after stdin EOF")?
        .context("run task panicked")?
        .context("run failed")?;
    assert_eq!(result.ret, 0);
    Ok(())
}

#[tokio::test]
async fn detached_run_reports_the_raw_wait_status() -> Result<()> {
    let instance = StubInstance::running("c1", Default::default());

    let action = exec_post(
        instance.as_ref() as &dyn Instance,
        Arc::new(HostExec),
        ExecPost {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            environment: None,
            wait_for_websocket: false,
            interactive: false,
        },
    )?;
    let ExecAction::Detached(detached) = action else {
        panic!("expected a detached run");
    };

    let result = detached.run().await?;
    // Raw wait status: exit code in the high byte, so clients can tell
    // exits from signal terminations.
    assert_eq!(result.ret, 3 << 8);
    Ok(())
}

#[tokio::test]
async fn environment_home_sets_the_working_directory() -> Result<()> {
    let instance = StubInstance::running("c1", Default::default());

    let action = exec_post(
        instance.as_ref() as &dyn Instance,
        Arc::new(HostExec),
        ExecPost {
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "test \"$(pwd)\" = /tmp".to_string(),
            ],
            environment: Some(
                [("HOME".to_string(), "/tmp".to_string())]
                    .into_iter()
                    .collect(),
            ),
            wait_for_websocket: false,
            interactive: false,
        },
    )?;
    let ExecAction::Detached(detached) = action else {
        panic!("expected a detached run");
    };

    assert_eq!(detached.run().await?.ret, 0);
    Ok(())
}

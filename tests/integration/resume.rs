use anyhow::Result;
use bytes::Bytes;

use gtp_core::wire::RstCode;
use gtp_gate::{Event, Gate, Received, ResumeTicket, SessionState, Transport};

use crate::*;

fn authenticated_gate() -> GateBuilder {
    Gate::builder(test_config()).authenticator(|_: &gtp_gate::ConnInfo, user: &str, token: &str, _: &[u8]| {
        anyhow::ensure!(!user.is_empty() && !token.is_empty(), "missing credentials");
        Ok(())
    })
}

async fn resume(tg: &TestGate, ticket: &ResumeTicket) -> Result<ClientSession> {
    let transport = Transport::connect_tcp(tg.tcp).await?;
    Ok(connector().resume(transport, ticket).await?)
}

/// Messages the client never read, including ones queued while it was away,
/// arrive in order after a resume on a new connection.
#[tokio::test]
async fn resume_redelivers_unread_messages() -> Result<()> {
    let tg = start(authenticated_gate()).await?;
    let mut client = connect(&tg, &connector().credentials("bob", "bob-token")).await?;
    let session = server_session(&tg, &client).await?;

    session.send_event(Event::new(40, "one"))?;
    assert_eq!(within("first", client.recv()).await??, Received::Event(Event::new(40, "one")));
    client.send_data("up").await?;
    assert_eq!(within("upstream", session.recv_data()).await?, Some(Bytes::from_static(b"up")));

    session.send_event(Event::new(41, "two"))?;
    session.send_data("three")?;
    let ticket = client.disconnect().await;
    assert_eq!(ticket.recv_seq, 1);
    assert_eq!(ticket.user_id, "bob");

    wait_until("session inactive", || session.state() == SessionState::Inactive).await?;
    session.send_data("four")?;

    let mut client = resume(&tg, &ticket).await?;
    assert!(client.resumed());
    assert!(client.authenticated());
    assert_eq!(client.id(), session.id());
    assert_eq!(client.sequences(), (1, 1));
    assert_eq!(client.cipher_suite(), session.cipher_suite());

    assert_eq!(within("two", client.recv()).await??, Received::Event(Event::new(41, "two")));
    assert_eq!(within("three", client.recv()).await??, Received::Data(Bytes::from_static(b"three")));
    assert_eq!(within("four", client.recv()).await??, Received::Data(Bytes::from_static(b"four")));

    wait_until("session active again", || session.state() == SessionState::Active).await?;
    assert_eq!(tg.gate.count_sessions(), 1);

    // upstream continues from where the gate left off
    assert_eq!(client.send_data("again").await?, 1);
    assert_eq!(within("upstream after resume", session.recv_data()).await?, Some(Bytes::from_static(b"again")));

    client.close().await;
    within("session close", session.closed()).await?;
    assert_eq!(tg.gate.count_sessions(), 0);
    tg.gate.shutdown().await;
    Ok(())
}

/// A resume can replace a link the gate still thinks is alive.
#[tokio::test]
async fn resume_replaces_live_link() -> Result<()> {
    let tg = start_default().await?;
    let mut old = connect(&tg, &connector()).await?;
    let session = server_session(&tg, &old).await?;
    let ticket = old.ticket();
    assert!(ticket.user_id.is_empty(), "no credentials were exchanged");

    let mut client = resume(&tg, &ticket).await?;
    assert!(client.resumed());

    // the old link is dropped, not the session
    assert!(within("old link closed", old.recv()).await?.is_err());
    assert_eq!(session.state(), SessionState::Active);

    session.send_data("new link")?;
    assert_eq!(within("data", client.recv()).await??, Received::Data(Bytes::from_static(b"new link")));

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

/// A resume the gate cannot satisfy leaves the session as it was.
#[tokio::test]
async fn failed_resume_leaves_session_untouched() -> Result<()> {
    let tg = start(authenticated_gate()).await?;
    let client = connect(&tg, &connector().credentials("carol", "carol-token")).await?;
    let session = server_session(&tg, &client).await?;
    session.send_data("pending")?;
    let ticket = client.disconnect().await;
    wait_until("session inactive", || session.state() == SessionState::Inactive).await?;

    // ahead of anything the gate ever sent
    let ahead = ResumeTicket { recv_seq: ticket.recv_seq + 5, ..ticket.clone() };
    let err = resume(&tg, &ahead).await.err().expect("resume ahead of the gate should fail");
    assert_eq!(gate_error(&err).and_then(reset_code), Some(RstCode::ContinueFailed));

    // someone else's token
    let stolen = ResumeTicket { token: "guess".into(), ..ticket.clone() };
    let err = resume(&tg, &stolen).await.err().expect("resume with a wrong token should fail");
    assert_eq!(gate_error(&err).and_then(reset_code), Some(RstCode::AuthFailed));

    assert_eq!(session.state(), SessionState::Inactive);
    assert_eq!(session.sequences(), (1, 0));
    assert_eq!(tg.gate.count_sessions(), 1);

    let mut client = resume(&tg, &ticket).await?;
    assert_eq!(within("pending", client.recv()).await??, Received::Data(Bytes::from_static(b"pending")));

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

/// Messages the client already acknowledged are gone from the gate's cache,
/// so a resume from before them cannot be satisfied.
#[tokio::test]
async fn resume_behind_window_fails() -> Result<()> {
    let tg = start_default().await?;
    let mut client = connect(&tg, &connector()).await?;
    let session = server_session(&tg, &client).await?;

    session.send_data("a")?;
    session.send_data("b")?;
    within("a", client.recv()).await??;
    within("b", client.recv()).await??;
    // carries ack = 2
    client.send_data("ack").await?;
    within("ack", session.recv_data()).await?;

    let stale = ResumeTicket { recv_seq: 0, ..client.ticket() };
    client.disconnect().await;
    wait_until("session inactive", || session.state() == SessionState::Inactive).await?;

    let err = resume(&tg, &stale).await.err().expect("resume behind the window should fail");
    assert_eq!(gate_error(&err).and_then(reset_code), Some(RstCode::ContinueFailed));
    assert_eq!(session.state(), SessionState::Inactive);
    assert!(tg.gate.get_session(session.id()).is_some());

    tg.gate.shutdown().await;
    Ok(())
}

/// A session nobody resumes dies after the inactive timeout.
#[tokio::test]
async fn inactive_session_expires() -> Result<()> {
    let mut config = test_config();
    config.session.inactive_timeout_ms = 200;
    let tg = start(Gate::builder(config)).await?;

    let client = connect(&tg, &connector()).await?;
    let session = server_session(&tg, &client).await?;
    let ticket = client.disconnect().await;

    within("session expiry", session.closed()).await?;
    assert_eq!(session.state(), SessionState::Death);
    assert!(tg.gate.get_session(&ticket.session_id).is_none());

    let err = resume(&tg, &ticket).await.err().expect("expired session should not resume");
    assert_eq!(gate_error(&err).and_then(reset_code), Some(RstCode::SessionNotFound));

    tg.gate.shutdown().await;
    Ok(())
}

//! Refresh triggers: terminal focus and network reconnection.

use std::future::Future;
use std::time::Duration;

use crossterm::event::{self, Event as TerminalEvent, KeyCode, KeyEventKind, KeyModifiers};
use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Signals that cached data may be out of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
  /// The terminal window regained focus
  FocusGained,
  /// Connectivity came back after an outage
  Reconnected,
}

/// Terminal events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  Client(ClientEvent),
  /// `q`, `Esc` or Ctrl-C
  Quit,
  /// Periodic tick, also emitted when nothing else happened
  Tick,
}

/// Event handler that produces events from terminal input and a tick timer.
///
/// Focus events are only reported once focus change reporting is enabled on
/// the terminal, and quit keys only arrive in raw mode.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // crossterm polling blocks
    tokio::task::spawn_blocking(move || loop {
      let event = if event::poll(tick_rate).unwrap_or(false) {
        match event::read() {
          Ok(evt) => translate(evt),
          Err(_) => None,
        }
      } else {
        Some(Event::Tick)
      };

      if let Some(event) = event {
        if tx.send(event).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

fn translate(event: TerminalEvent) -> Option<Event> {
  match event {
    TerminalEvent::FocusGained => Some(Event::Client(ClientEvent::FocusGained)),
    TerminalEvent::Key(key) if key.kind == KeyEventKind::Press => match key.code {
      KeyCode::Char('q') | KeyCode::Esc => Some(Event::Quit),
      KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Event::Quit),
      _ => None,
    },
    _ => None,
  }
}

/// Tracks reachability and reports offline to online transitions.
#[derive(Debug, Default)]
pub struct LinkState {
  online: Option<bool>,
}

impl LinkState {
  /// Record a reachability check. Returns `Reconnected` when the link comes back.
  ///
  /// The first observation only establishes the baseline.
  pub fn observe(&mut self, reachable: bool) -> Option<ClientEvent> {
    let previous = self.online.replace(reachable);
    match (previous, reachable) {
      (Some(false), true) => {
        info!("connection restored");
        Some(ClientEvent::Reconnected)
      }
      (Some(true) | None, false) => {
        info!("connection lost");
        None
      }
      _ => None,
    }
  }

  pub fn is_online(&self) -> Option<bool> {
    self.online
  }
}

/// Check connectivity every `every` and yield `Reconnected` on each recovery.
///
/// The checking task stops once the stream is dropped.
pub fn connectivity_events<P, Fut>(
  mut check: P,
  every: Duration,
) -> impl Stream<Item = ClientEvent> + Send + 'static
where
  P: FnMut() -> Fut + Send + 'static,
  Fut: Future<Output = bool> + Send + 'static,
{
  let (tx, mut rx) = mpsc::unbounded_channel();

  tokio::spawn(async move {
    let mut link = LinkState::default();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !tx.is_closed() {
      ticker.tick().await;
      if let Some(event) = link.observe(check().await) {
        if tx.send(event).is_err() {
          break;
        }
      }
    }
  });

  futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
}

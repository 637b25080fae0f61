use std::{
    collections::BTreeMap,
    fmt::Debug,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::lock;

/// Cadence at which pending commands are checked.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Re-sends a pending command. Receives the subject and the command payload.
/// A panic is caught and logged like an error.
pub type RepeatAction<P> = Arc<dyn Fn(&str, &P) -> anyhow::Result<()> + Send + Sync>;

struct PendingCommand<P> {
    payload: P,
    action: RepeatAction<P>,
    last_sent: Instant,
}

type CommandKey = (String, String);
type Commands<P> = Arc<Mutex<BTreeMap<CommandKey, PendingCommand<P>>>>;

/// Keeps re-sending commands the transport may have lost until they are
/// confirmed and removed.
pub struct CommandRepeater<P> {
    commands: Commands<P>,
    delay: Duration,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P> CommandRepeater<P>
where
    P: Clone + Debug + PartialEq + Send + 'static,
{
    /// Spawns the repeat loop on the current tokio runtime.
    pub fn start(delay: Duration) -> Self {
        Self::start_with_interval(delay, CHECK_INTERVAL)
    }

    pub fn start_with_interval(delay: Duration, check_interval: Duration) -> Self {
        info!(delay_sec = delay.as_secs(), "starting command repeater");
        let commands: Commands<P> = Arc::default();
        let (shutdown, mut stopped) = watch::channel(false);

        let task = tokio::spawn({
            let commands = commands.clone();
            async move {
                let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = stopped.changed() => break,
                        _ = ticker.tick() => {
                            repeat_due(&commands, delay);
                        }
                    }
                }
                info!("command repeater stopped");
            }
        });

        Self {
            commands,
            delay,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Inserts or replaces the command for `(subject, kind)`. The caller sends
    /// it once itself; the repeater only takes over if it is not confirmed.
    pub fn add(&self, subject: &str, kind: &str, payload: P, action: RepeatAction<P>) {
        debug!(subject, kind, ?payload, "adding command to repeater");
        lock(&self.commands).insert(
            (subject.to_string(), kind.to_string()),
            PendingCommand {
                payload,
                action,
                last_sent: Instant::now(),
            },
        );
    }

    pub fn remove(&self, subject: &str, kind: &str) -> bool {
        let removed = lock(&self.commands)
            .remove(&(subject.to_string(), kind.to_string()))
            .is_some();
        if removed {
            debug!(subject, kind, "removing command from repeater");
        }
        removed
    }

    pub fn remove_all_for(&self, subject: &str) -> usize {
        let mut commands = lock(&self.commands);
        let before = commands.len();
        commands.retain(|(pending_subject, _), _| pending_subject != subject);
        let removed = before - commands.len();
        if removed > 0 {
            debug!(subject, removed, "removing all commands of subject");
        }
        removed
    }

    pub fn rename_subject(&self, old: &str, new: &str) {
        let mut commands = lock(&self.commands);
        let keys: Vec<CommandKey> = commands
            .keys()
            .filter(|(subject, _)| subject == old)
            .cloned()
            .collect();
        for key in keys {
            if let Some(command) = commands.remove(&key) {
                commands.insert((new.to_string(), key.1), command);
            }
        }
    }

    pub fn pending_payload(&self, subject: &str, kind: &str) -> Option<P> {
        lock(&self.commands)
            .get(&(subject.to_string(), kind.to_string()))
            .map(|command| command.payload.clone())
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.commands).len()
    }

    /// Re-sends every command older than the delay. Returns how many were sent.
    pub fn repeat_due(&self) -> usize {
        repeat_due(&self.commands, self.delay)
    }

    /// Stops the repeat loop and waits for it to finish.
    pub async fn stop(&self) {
        info!("stopping command repeater");
        let _ = self.shutdown.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!("command repeater task failed: {err}");
            }
        }
    }
}

fn repeat_due<P: Clone + Debug + PartialEq>(commands: &Commands<P>, delay: Duration) -> usize {
    let now = Instant::now();
    let due: Vec<(CommandKey, P, RepeatAction<P>, Duration)> = lock(commands)
        .iter()
        .filter_map(|(key, command)| {
            let age = now.saturating_duration_since(command.last_sent);
            (age >= delay).then(|| (key.clone(), command.payload.clone(), command.action.clone(), age))
        })
        .collect();

    for ((subject, kind), payload, action, age) in &due {
        warn!(
            subject = %subject,
            kind = %kind,
            ?payload,
            age_sec = age.as_secs(),
            "repeating unconfirmed command"
        );
        match catch_unwind(AssertUnwindSafe(|| action(subject, payload))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(subject = %subject, kind = %kind, "repeated command failed: {err:#}");
            }
            Err(_) => error!(subject = %subject, kind = %kind, "repeated command panicked"),
        }
    }

    let mut commands = lock(commands);
    let sent_at = Instant::now();
    for (key, payload, ..) in &due {
        // Replaced while the actions ran: the new entry keeps its own timestamp.
        if let Some(command) = commands.get_mut(key).filter(|command| command.payload == *payload) {
            command.last_sent = sent_at;
        }
    }
    due.len()
}

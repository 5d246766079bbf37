use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use chorus_core::conversation::{Agent, Message, Roster};
use chorus_core::ids::AgentId;
use chorus_engine::{
    DecisionConfig, DecisionPolicy, PauseFlag, SchedulerConfig, SchedulerSnapshot, TurnScheduler,
};

fn id(s: &str) -> AgentId {
    AgentId::from_raw(s)
}

fn roster() -> Roster {
    Roster::new([
        Agent::new("Ada", "ada", "m").with_id(id("a")),
        Agent::new("Bob", "bob", "m").with_id(id("b")),
        Agent::new("Cy", "cy", "m").with_id(id("c")),
        Agent::new("Di", "di", "m").with_id(id("d")),
    ])
}

fn no_jitter() -> DecisionConfig {
    DecisionConfig {
        jitter: Duration::ZERO,
        ..DecisionConfig::default()
    }
}

fn spawn_with(pause: PauseFlag) -> (TurnScheduler, mpsc::UnboundedReceiver<AgentId>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = TurnScheduler::builder(SchedulerConfig::default(), DecisionPolicy::new(no_jitter()))
        .pause_checker(pause)
        .spawn(tx);
    (scheduler, rx)
}

fn spawn() -> (TurnScheduler, mpsc::UnboundedReceiver<AgentId>) {
    spawn_with(PauseFlag::new())
}

fn agent(roster: &Roster, s: &str) -> Agent {
    roster.get(&id(s)).cloned().unwrap()
}

/// Timer wheel resolution is one millisecond.
fn assert_near(elapsed: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(5),
        "expected ~{expected:?}, got {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn mention_bypasses_cooldown() {
    let (scheduler, _rx) = spawn();
    let roster = roster();
    let ada = agent(&roster, "a");
    scheduler.complete_response(ada.id.clone());

    let mention = Message::from_agent(id("b"), "what do you think, @ada");
    let d = scheduler.decide(&ada, &mention, &roster).await.unwrap();
    assert!(d.should_respond);
    assert_eq!(d.priority, 100);
}

#[tokio::test(start_paused = true)]
async fn cooldown_gates_unmentioned_messages() {
    let (scheduler, _rx) = spawn();
    let roster = roster();
    let ada = agent(&roster, "a");
    scheduler.complete_response(ada.id.clone());

    let d = scheduler
        .decide(&ada, &Message::human("anyone?"), &roster)
        .await
        .unwrap();
    assert!(!d.should_respond);

    tokio::time::advance(Duration::from_millis(8000)).await;
    let d = scheduler
        .decide(&ada, &Message::human("anyone?"), &roster)
        .await
        .unwrap();
    assert!(d.should_respond);
}

#[tokio::test(start_paused = true)]
async fn silence_raises_priority() {
    let (scheduler, _rx) = spawn();
    let roster = roster();
    let ada = agent(&roster, "a");
    let chatter = || Message::from_agent(id("b"), "interesting");

    let first = scheduler.decide(&ada, &chatter(), &roster).await.unwrap();
    let second = scheduler.decide(&ada, &chatter(), &roster).await.unwrap();
    let third = scheduler.decide(&ada, &chatter(), &roster).await.unwrap();
    assert_eq!(first.priority, 50);
    assert_eq!(second.priority, 50);
    assert_eq!(third.priority, 60);

    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.silence_of(&ada.id), 3);

    scheduler.complete_response(ada.id.clone());
    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.silence_of(&ada.id), 0);
}

#[tokio::test(start_paused = true)]
async fn second_speaker_is_queued_not_dispatched() {
    let (scheduler, mut rx) = spawn();
    scheduler.queue_response(id("a"), Duration::ZERO, 50);
    scheduler.queue_response(id("b"), Duration::from_millis(10), 100);

    assert_eq!(rx.recv().await, Some(id("a")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.streaming, vec![id("a")]);
    assert_eq!(snap.queued, vec![(id("b"), 100)]);
    assert_eq!(snap.responding, 1);
}

#[tokio::test(start_paused = true)]
async fn queue_drains_by_priority_then_arrival() {
    let (scheduler, mut rx) = spawn();
    scheduler.queue_response(id("a"), Duration::ZERO, 50);
    assert_eq!(rx.recv().await, Some(id("a")));

    scheduler.queue_response(id("b"), Duration::from_millis(10), 70);
    scheduler.queue_response(id("c"), Duration::from_millis(20), 90);
    scheduler.queue_response(id("d"), Duration::from_millis(30), 70);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.queued, vec![(id("c"), 90), (id("b"), 70), (id("d"), 70)]);

    let mut order = Vec::new();
    let mut current = id("a");
    for _ in 0..3 {
        scheduler.complete_response(current.clone());
        current = rx.recv().await.unwrap();
        order.push(current.clone());
    }
    assert_eq!(order, vec![id("c"), id("b"), id("d")]);
}

#[tokio::test(start_paused = true)]
async fn duplicate_queue_calls_arm_one_timer() {
    let (scheduler, mut rx) = spawn();
    scheduler.queue_response(id("a"), Duration::from_millis(100), 50);
    scheduler.queue_response(id("a"), Duration::from_millis(50), 100);

    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.pending, vec![id("a")]);

    let start = Instant::now();
    assert_eq!(rx.recv().await, Some(id("a")));
    assert_near(start.elapsed(), 100);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn reset_matches_fresh_scheduler() {
    let (scheduler, mut rx) = spawn();
    let roster = roster();
    let ada = agent(&roster, "a");
    let bob = agent(&roster, "b");

    scheduler.queue_response(id("a"), Duration::ZERO, 50);
    assert_eq!(rx.recv().await, Some(id("a")));
    scheduler.queue_response(id("b"), Duration::from_millis(10), 70);
    scheduler.queue_response(id("c"), Duration::from_secs(5), 70);
    scheduler.decide(&bob, &Message::human("x"), &roster).await.unwrap();
    scheduler.complete_response(id("d"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    scheduler.reset();
    assert_eq!(scheduler.snapshot().await.unwrap(), SchedulerSnapshot::default());

    // Cancelled timers never fire.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());

    let (fresh, _fresh_rx) = spawn();
    let trigger = Message::human("hello?");
    assert_eq!(
        scheduler.decide(&ada, &trigger, &roster).await.unwrap(),
        fresh.decide(&ada, &trigger, &roster).await.unwrap()
    );
    assert_eq!(
        scheduler.snapshot().await.unwrap(),
        fresh.snapshot().await.unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn paused_timers_recheck_without_dispatching() {
    let pause = PauseFlag::new();
    pause.set(true);
    let (scheduler, mut rx) = spawn_with(pause.clone());

    scheduler.queue_response(id("a"), Duration::from_millis(100), 50);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());

    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.pending, vec![id("a")]);
    assert_eq!(snap.responding, 0);
    assert!(snap.streaming.is_empty());

    pause.set(false);
    let start = Instant::now();
    assert_eq!(rx.recv().await, Some(id("a")));
    assert!(start.elapsed() <= Duration::from_millis(500));
    assert_eq!(scheduler.snapshot().await.unwrap().responding, 1);
}

#[tokio::test(start_paused = true)]
async fn reading_pause_holds_the_slot() {
    let (scheduler, mut rx) = spawn();
    scheduler.queue_response(id("a"), Duration::ZERO, 50);
    assert_eq!(rx.recv().await, Some(id("a")));
    scheduler.queue_response(id("b"), Duration::from_millis(10), 70);
    tokio::time::sleep(Duration::from_millis(20)).await;

    scheduler.complete_response(id("a"));
    let handed_off = Instant::now();

    // During the reading pause b is pending again and keeps the slot.
    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.pending, vec![id("b")]);
    assert!(snap.queued.is_empty());
    assert_eq!(snap.responding, 1);

    // A third trigger for b is ignored; c arriving meanwhile must wait.
    scheduler.queue_response(id("b"), Duration::from_millis(10), 100);
    scheduler.queue_response(id("c"), Duration::from_millis(100), 60);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(
        scheduler.snapshot().await.unwrap().queued,
        vec![(id("c"), 60)]
    );

    assert_eq!(rx.recv().await, Some(id("b")));
    assert!(handed_off.elapsed() >= Duration::from_millis(8000));
    assert_eq!(scheduler.snapshot().await.unwrap().responding, 1);
}

#[tokio::test(start_paused = true)]
async fn completion_while_paused_releases_slot() {
    let pause = PauseFlag::new();
    let (scheduler, mut rx) = spawn_with(pause.clone());
    scheduler.queue_response(id("a"), Duration::ZERO, 50);
    assert_eq!(rx.recv().await, Some(id("a")));
    scheduler.queue_response(id("b"), Duration::from_millis(10), 70);
    tokio::time::sleep(Duration::from_millis(20)).await;

    pause.set(true);
    scheduler.complete_response(id("a"));
    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.responding, 0);
    assert!(snap.pending.is_empty());
    assert_eq!(snap.queued, vec![(id("b"), 70)]);
}

#[tokio::test(start_paused = true)]
async fn retry_bypasses_cooldown() {
    let (scheduler, mut rx) = spawn();
    let roster = roster();
    let ada = agent(&roster, "a");

    scheduler.queue_response(id("a"), Duration::ZERO, 50);
    assert_eq!(rx.recv().await, Some(id("a")));
    scheduler.complete_response(id("a"));
    scheduler.force_queue_response(id("a"), Duration::from_millis(2000), 90);

    let snap = scheduler.snapshot().await.unwrap();
    assert!(snap.cooling_down.is_empty());
    assert_eq!(snap.pending, vec![id("a")]);

    let d = scheduler.decide(&ada, &Message::human("hi"), &roster).await.unwrap();
    assert!(d.should_respond);

    let start = Instant::now();
    assert_eq!(rx.recv().await, Some(id("a")));
    assert_near(start.elapsed(), 2000);
}

#[tokio::test(start_paused = true)]
async fn mention_question_scenario() {
    let (scheduler, mut rx) = spawn();
    let roster = Roster::new([
        Agent::new("Alpha", "A", "m").with_id(id("a")),
        Agent::new("Beta", "B", "m").with_id(id("b")),
    ]);
    let trigger = Message::human("hello @A?");
    let start = Instant::now();

    for agent in roster.iter() {
        let d = scheduler.decide(agent, &trigger, &roster).await.unwrap();
        assert!(d.should_respond);
        scheduler.queue_response(agent.id.clone(), d.delay, d.priority);
    }

    let a = scheduler.decide(&agent(&roster, "a"), &trigger, &roster).await.unwrap();
    assert_eq!(a.priority, 100);
    let b = scheduler.decide(&agent(&roster, "b"), &trigger, &roster).await.unwrap();
    assert!(b.priority >= 70);

    assert_eq!(rx.recv().await, Some(id("a")));
    assert_near(start.elapsed(), 2000);

    tokio::time::sleep_until(start + Duration::from_millis(3000)).await;
    let snap = scheduler.snapshot().await.unwrap();
    assert_eq!(snap.queued.len(), 1);
    assert_eq!(snap.queued[0].0, id("b"));

    scheduler.complete_response(id("a"));
    assert_eq!(rx.recv().await, Some(id("b")));
    assert_near(start.elapsed(), 11_000);
}

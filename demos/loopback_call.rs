//! Loopback call demo for PeerLink
//!
//! Two sessions share an in-process network and synthetic devices. Alice
//! calls Bob, turns background replacement on, shares her screen for a
//! moment and hangs up.

use peerlink::{
    init_default_logging, BackgroundLibrary, CallStatus, Event, EventFilter, LoopbackNetwork,
    Session, SyntheticDevices, DEFAULT_BACKGROUND,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_default_logging()?;

    println!("🚀 Starting loopback call demo");
    let network = LoopbackNetwork::new();
    let backgrounds = Arc::new(BackgroundLibrary::new());
    backgrounds.insert_color(DEFAULT_BACKGROUND, [30, 90, 160, 255]);

    let alice = Session::builder()
        .transport(network.transport(Some("alice")))
        .devices(Arc::new(SyntheticDevices::new()))
        .backgrounds(backgrounds.clone())
        .start()
        .await?;
    let bob = Session::builder()
        .transport(network.transport(Some("bob")))
        .devices(Arc::new(SyntheticDevices::new()))
        .backgrounds(backgrounds)
        .start()
        .await?;

    let mut alice_events = alice.events().filtered(EventFilter::all());
    let mut bob_events = bob.events().filtered(EventFilter::call_only());

    println!("🔗 Connecting alice to bob...");
    alice.connect("bob").await?;
    wait_until(&mut alice_events, |e| matches!(e, Event::PeerConnected { .. })).await?;

    println!("📞 Calling bob...");
    alice.start_call().await?;
    wait_until(&mut alice_events, |e| {
        matches!(e, Event::CallStatusChanged { status: CallStatus::Connected })
    })
    .await?;
    println!("✅ Call connected");

    println!("🎨 Enabling background replacement...");
    let enabled = alice.set_background_removal(true).await?;
    println!("   Background replacement on: {}", enabled);

    println!("🖥️ Sharing screen...");
    alice.start_screen_share().await?;
    alice.set_page_visible(false).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    if let Some(rtt) = alice.ping_worker().await {
        println!("   Keep-alive worker answered in {:?}", rtt);
    }
    alice.set_page_visible(true).await;
    alice.stop_screen_share().await;

    let metrics = alice.local_metrics().await;
    println!(
        "📺 Local video aspect {:.2} (portrait: {})",
        metrics.aspect_ratio, metrics.is_portrait
    );

    println!("📴 Hanging up");
    alice.end_call().await;
    wait_until(&mut bob_events, |e| matches!(e, Event::CallEnded { .. })).await?;

    println!("📊 Alice resources: {:?}", alice.resource_stats().await);

    alice.shutdown().await;
    bob.shutdown().await;
    println!("🛑 Demo finished");
    Ok(())
}

async fn wait_until(
    events: &mut peerlink::FilteredEventStream,
    matches: impl Fn(&Event) -> bool,
) -> anyhow::Result<Event> {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.next().await {
            println!("   📡 {}", event.event_type());
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await?;
    found.ok_or_else(|| anyhow::anyhow!("event stream closed"))
}

use std::pin::pin;

use bluetray::{AgentEvent, Applet, Reply, Session, StateEvent};
use futures_util::{
    future::{self, Either},
    StreamExt,
};

enum Event {
    Agent(AgentEvent),
    State(StateEvent),
}

#[pollster::main]
async fn main() -> bluetray::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .init();

    let session = Session::new().await?;
    let (applet, agent_events, state_events) = Applet::new(&session).await?;

    match bluetray::Adapter::open(&session).await {
        Ok(adapter) => println!(
            "default adapter: {} ({})",
            adapter.device_name(),
            adapter.address().await?
        ),
        Err(e) => println!("no usable adapter: {}", e),
    }
    println!("killswitch: {:?}", applet.killswitch_state());
    println!("discoverable: {}", applet.is_discoverable());
    for device in applet.devices().await? {
        println!(
            "{} ({}): paired={} connected={}",
            device.alias, device.address, device.paired, device.connected
        );
    }

    let mut events = futures_util::stream::select(
        agent_events.map(Event::Agent),
        state_events.map(Event::State),
    );
    let ui = async {
        while let Some(event) = events.next().await {
            match event {
                Event::Agent(event) => handle_prompt(&applet, event).await,
                Event::State(event) => println!("state: {:?}", event),
            }
        }
    };

    let result = match future::select(pin!(applet.run()), pin!(ui)).await {
        Either::Left((result, _)) => result,
        Either::Right(((), _)) => Ok(()),
    };
    result
}

/// Prints pairing prompts and declines them all; a real UI would ask the
/// user.
async fn handle_prompt(applet: &Applet, event: AgentEvent) {
    match event {
        AgentEvent::PincodeNeeded {
            token,
            label,
            numeric,
            ..
        } => {
            println!("{} asks for a PIN (numeric: {}), declining", label, numeric);
            let reply = if numeric {
                Reply::Pincode(None)
            } else {
                Reply::Passkey(None)
            };
            applet.reply(&token, reply).await;
        }
        AgentEvent::ConfirmNeeded {
            token, label, pin, ..
        } => {
            println!("{} asks to confirm {:06}, declining", label, pin);
            applet.reply(&token, Reply::Confirm(false)).await;
        }
        AgentEvent::AuthorizeNeeded {
            token,
            label,
            service_uuid,
            ..
        } => {
            println!(
                "{} asks for authorization ({}), declining",
                label,
                service_uuid.as_deref().unwrap_or("pairing")
            );
            applet
                .reply(
                    &token,
                    Reply::Authorize {
                        accept: false,
                        remember: false,
                    },
                )
                .await;
        }
        AgentEvent::Cancelled => println!("all prompts cancelled"),
    }
}

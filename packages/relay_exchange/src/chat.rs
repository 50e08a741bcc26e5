//! Demo relay served by the binary.

use relay_exchange::{Relay, RelayBuilder, RelayHandle};
use serde_json::json;
use tracing::debug;

#[derive(Default)]
pub struct Chat;

impl Relay for Chat {
    const NAME: &'static str = "Chat";

    fn define(methods: RelayBuilder<Self>) -> RelayBuilder<Self> {
        methods
            .method("Broadcast", |_: Chat, handle: RelayHandle, (text,): (String,)| async move {
                let from = handle.connection_id().unwrap_or_default().to_string();
                handle.clients().all("receive", vec![json!(from), json!(text)]).await;
            })
            .method(
                "Whisper",
                |_: Chat, handle: RelayHandle, (to, text): (String, String)| async move {
                    let from = handle.connection_id().unwrap_or_default().to_string();
                    handle
                        .clients()
                        .client(&to, "whisper", vec![json!(from), json!(text)])
                        .await;
                },
            )
            .method("Join", |_: Chat, handle: RelayHandle, (room,): (String,)| async move {
                match handle.join(&room).await {
                    Ok(true) => {
                        let who = handle.connection_id().unwrap_or_default().to_string();
                        handle
                            .clients()
                            .group_except(&room, "joined", vec![json!(who), json!(room)])
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => debug!("join failed: {}", e),
                }
            })
            .method("Leave", |_: Chat, handle: RelayHandle, (room,): (String,)| async move {
                if handle.leave(&room).await {
                    let who = handle.connection_id().unwrap_or_default().to_string();
                    handle
                        .clients()
                        .group(&room, "left", vec![json!(who), json!(room)])
                        .await;
                }
            })
            .method(
                "SendToRoom",
                |_: Chat, handle: RelayHandle, (room, text): (String, String)| async move {
                    let from = handle.connection_id().unwrap_or_default().to_string();
                    handle
                        .clients()
                        .group(&room, "receive", vec![json!(from), json!(text)])
                        .await;
                },
            )
    }
}

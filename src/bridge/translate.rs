//! Per-packet translation hook.
//!
//! Field-level mapping between the two protocols lives outside the bridge.
//! The bridge hands every packet it does not route itself to a
//! `PacketTranslator`, which may only send through the two ordered legs.

use super::backend::BackSender;
use super::dimension::WorldCaches;
use super::FrontLink;
use crate::protocol::back::BackPacket;
use crate::protocol::front::{FrontPacket, TEXT_SYSTEM, TITLE_ACTIONBAR};

/// Send primitives available to a translator.
pub struct TranslateCtx<'a> {
    pub session_id: u64,
    front: &'a mut FrontLink,
    back: Option<&'a BackSender>,
    caches: &'a mut WorldCaches,
}

impl<'a> TranslateCtx<'a> {
    pub fn new(
        session_id: u64,
        front: &'a mut FrontLink,
        back: Option<&'a BackSender>,
        caches: &'a mut WorldCaches,
    ) -> Self {
        Self {
            session_id,
            front,
            back,
            caches,
        }
    }

    pub fn send_front(&mut self, packet: &FrontPacket) {
        self.caches.observe(packet);
        if let Err(e) = self.front.send(packet) {
            tracing::warn!(
                "[translate] [front_send_failed] session={} packet={} error={}",
                self.session_id,
                packet.name(),
                e
            );
        }
    }

    /// Dropped with a debug line when no backend is attached.
    pub fn send_back(&mut self, packet: &BackPacket) {
        match self.back {
            Some(back) => {
                if let Err(e) = back.send(packet) {
                    tracing::debug!(
                        "[translate] [back_send_failed] session={} packet={} error={}",
                        self.session_id,
                        packet.name(),
                        e
                    );
                }
            }
            None => tracing::debug!(
                "[translate] [no_backend] session={} packet={}",
                self.session_id,
                packet.name()
            ),
        }
    }
}

pub trait PacketTranslator: Send + Sync {
    fn translate_front(&self, ctx: &mut TranslateCtx<'_>, packet: FrontPacket);

    fn translate_back(&self, ctx: &mut TranslateCtx<'_>, packet: BackPacket);
}

/// Minimal translator: backend chat reaches the player, nothing else moves.
pub struct PassthroughTranslator;

impl PacketTranslator for PassthroughTranslator {
    fn translate_front(&self, ctx: &mut TranslateCtx<'_>, packet: FrontPacket) {
        tracing::debug!(
            "[translate] [front_dropped] session={} packet={}",
            ctx.session_id,
            packet.name()
        );
    }

    fn translate_back(&self, ctx: &mut TranslateCtx<'_>, packet: BackPacket) {
        match packet {
            BackPacket::SystemChat { message, overlay: true } => ctx.send_front(&FrontPacket::SetTitle {
                kind: TITLE_ACTIONBAR,
                text: message,
            }),
            BackPacket::SystemChat { message, overlay: false } => ctx.send_front(&FrontPacket::Text {
                kind: TEXT_SYSTEM,
                source: String::new(),
                message,
            }),
            other => tracing::debug!(
                "[translate] [back_dropped] session={} packet={}",
                ctx.session_id,
                other.name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FrontOutbound;
    use crate::network::{FrameCodec, Role};
    use crate::protocol::front;
    use tokio::sync::mpsc;

    fn link() -> (FrontLink, mpsc::UnboundedReceiver<FrontOutbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FrontLink::new(FrameCodec::new(Role::Server), tx), rx)
    }

    fn next_packet(rx: &mut mpsc::UnboundedReceiver<FrontOutbound>) -> FrontPacket {
        let mut client = FrameCodec::new(Role::Client);
        match rx.try_recv().unwrap() {
            FrontOutbound::Frame(frame) => {
                let plain = client.decode(&frame).unwrap();
                front::decode(None, &plain).unwrap_or(FrontPacket::Opaque {
                    id: u16::from_be_bytes([plain[0], plain[1]]),
                    body: bytes::Bytes::copy_from_slice(&plain[2..]),
                })
            }
            FrontOutbound::Close => panic!("unexpected close"),
        }
    }

    #[test]
    fn test_system_chat_becomes_text() {
        let (mut front, mut rx) = link();
        let mut caches = WorldCaches::default();
        let mut ctx = TranslateCtx::new(1, &mut front, None, &mut caches);
        PassthroughTranslator.translate_back(
            &mut ctx,
            BackPacket::SystemChat {
                message: "hello".into(),
                overlay: false,
            },
        );

        // no codec bound, so the text packet comes back opaque
        match next_packet(&mut rx) {
            FrontPacket::Opaque { id, .. } => {
                assert_eq!(id, crate::protocol::codec::wire_id(crate::protocol::codec::PacketKind::Text))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_packets_dropped() {
        let (mut front, mut rx) = link();
        let (back_tx, mut back_rx) = mpsc::unbounded_channel();
        let back = BackSender::new(back_tx);
        let mut caches = WorldCaches::default();
        let mut ctx = TranslateCtx::new(1, &mut front, Some(&back), &mut caches);

        PassthroughTranslator.translate_back(&mut ctx, BackPacket::Respawn { dimension: "x".into() });
        PassthroughTranslator.translate_front(&mut ctx, FrontPacket::ClientToServerHandshake);

        assert!(rx.try_recv().is_err());
        assert!(back_rx.try_recv().is_err());
    }

    #[test]
    fn test_send_back_without_backend_is_noop() {
        let (mut front, _rx) = link();
        let mut caches = WorldCaches::default();
        let mut ctx = TranslateCtx::new(1, &mut front, None, &mut caches);
        ctx.send_back(&BackPacket::KeepAliveResponse { id: 1 });
    }

    #[test]
    fn test_translated_terrain_is_tracked() {
        let (mut front, _rx) = link();
        let mut caches = WorldCaches::default();
        let mut ctx = TranslateCtx::new(1, &mut front, None, &mut caches);
        ctx.send_front(&FrontPacket::LevelChunk {
            chunk_x: 4,
            chunk_z: -2,
            sub_chunk_count: 0,
            data: bytes::Bytes::new(),
        });
        assert!(caches.chunks.contains(&(4, -2)));
    }
}

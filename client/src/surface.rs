//! Collaborator seams: the rendering surface consuming draw calls and the
//! approval prompt consulted on the manager's client.

use async_trait::async_trait;

use protocol::{Shape, Stroke, TextBlock};

/// Pixel-level drawing is substitutable; the engine only decides what is
/// drawn and in which order.
pub trait RenderSurface {
    fn clear(&mut self);
    fn draw_stroke(&mut self, stroke: &Stroke);
    fn draw_shape(&mut self, shape: &Shape);
    fn draw_text(&mut self, text: &TextBlock);
}

/// Decision point invoked only on the manager's client when a join request
/// arrives. A GUI would pop a dialog here.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn approve(&self, target: &str) -> bool;
}

/// Admits everyone; used by the headless terminal client.
pub struct AutoApprove;

#[async_trait]
impl ApprovalPrompt for AutoApprove {
    async fn approve(&self, target: &str) -> bool {
        tracing::info!("auto-approving join request from {}", target);
        true
    }
}

/// Identifier validation.
pub mod id;
/// Session description and ICE candidate parsing.
pub mod sdp;

//! Window management using winit

use std::collections::HashSet;
use std::sync::Arc;
use winit::{
    dpi::PhysicalSize,
    error::OsError,
    event::{ElementState, WindowEvent},
    event_loop::EventLoopWindowTarget,
    keyboard::{KeyCode, PhysicalKey},
    window::{Window as WinitWindow, WindowBuilder},
};

/// Keys pressed since the input was last cleared
#[derive(Debug, Clone, Default)]
pub struct KeyInput {
    pressed: HashSet<KeyCode>,
}

impl KeyInput {
    pub fn press(&mut self, key: KeyCode) {
        self.pressed.insert(key);
    }

    pub fn was_pressed(&self, key: KeyCode) -> bool {
        self.pressed.contains(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.pressed.is_empty()
    }

    pub fn clear(&mut self) {
        self.pressed.clear();
    }
}

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
    input: KeyInput,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new<T>(
        event_loop: &EventLoopWindowTarget<T>,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, OsError> {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(title)
                .with_inner_size(PhysicalSize::new(width, height))
                .build(event_loop)?,
        );

        Ok(Self {
            window,
            width,
            height,
            resized: false,
            close_requested: false,
            input: KeyInput::default(),
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get arc reference to window
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Get current window dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check if window was resized since last frame
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    /// Clear the resize flag
    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Key presses collected since the last call
    pub fn take_input(&mut self) -> KeyInput {
        std::mem::take(&mut self.input)
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed && !event.repeat {
                    if let PhysicalKey::Code(code) = event.physical_key {
                        self.input.press(code);
                    }
                }
            }
            _ => {}
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_input_press_and_clear() {
        let mut input = KeyInput::default();
        assert!(input.is_empty());
        input.press(KeyCode::KeyB);
        input.press(KeyCode::KeyB);
        assert!(input.was_pressed(KeyCode::KeyB));
        assert!(!input.was_pressed(KeyCode::KeyM));
        input.clear();
        assert!(input.is_empty());
    }
}

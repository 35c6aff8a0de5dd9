//! Wires the transport, configuration, capture/render pipelines, and
//! collaborator implementations together for one connection, per role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::capture::{AdaptiveState, CaptureWorker};
use crate::collaborators::{EnigoInput, JpegCodec, OsInput, ScrapCapture, SdlDisplay, DisplaySurface, ScreenCapture};
use crate::config::{self, Configuration};
use crate::error::Result;
use crate::input::{self, InputEvent};
use crate::protocol::WireMessage;
use crate::render::RenderPipeline;
use crate::transport::Transport;

const FRAME_CHANNEL_DEPTH: usize = 4;
const INPUT_QUEUE_DEPTH: usize = 256;

/// Runs the controllee role to completion: captures frames, streams
/// updates, and applies incoming input events to the local OS. `transport`
/// is shared with the caller so a Ctrl-C handler can force it closed.
pub fn run_controllee(transport: Arc<Transport>, config: Configuration) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let adaptive = Arc::new(Mutex::new(AdaptiveState::new()));
    let capture: Arc<Mutex<Box<dyn ScreenCapture>>> = Arc::new(Mutex::new(Box::new(ScrapCapture::new()?)));

    let capture_worker = CaptureWorker::new(
        config.clone(),
        transport.clone(),
        capture.clone(),
        Box::new(JpegCodec::new()),
        adaptive.clone(),
    );
    let capture_running = running.clone();
    let capture_handle = thread::spawn(move || capture_worker.run(capture_running));

    let (input_tx, input_rx) = mpsc::sync_channel::<InputEvent>(INPUT_QUEUE_DEPTH);
    let input_config = config.clone();
    let input_capture = capture.clone();
    let input_handle = thread::spawn(move || {
        let mut os_input = match EnigoInput::new() {
            Ok(input) => input,
            Err(error) => {
                log::error!("input-inject worker could not start: {}", error);
                return;
            }
        };
        for event in input_rx {
            if !input_config.get_bool(config::KEY_SHOULD_UPDATE_COMMANDS, config::DEFAULT_SHOULD_UPDATE_COMMANDS) {
                continue;
            }
            let monitor = input_config.get_i64(config::KEY_MONITOR, config::DEFAULT_MONITOR).max(0) as usize;
            let extent = match input_capture.lock().unwrap().monitor_extent(monitor) {
                Ok(extent) => extent,
                Err(error) => {
                    log::warn!("could not read monitor extent: {}", error);
                    continue;
                }
            };
            if let Err(error) = input::apply_event(&event, extent, &mut os_input as &mut dyn OsInput) {
                log::warn!("input injection failed: {}", error);
            }
        }
    });

    let dispatch_config = config.clone();
    let dispatch_adaptive = adaptive.clone();
    let receive_handle = transport.spawn_receive_worker(move |payload| {
        match WireMessage::decode(&payload) {
            Ok(WireMessage::SetVar(set_var)) => dispatch_config.set(&set_var.variable, set_var.value),
            Ok(WireMessage::NewCommand(args)) => match InputEvent::from_args(&args) {
                Ok(event) => {
                    if input_tx.try_send(event).is_err() {
                        log::warn!("input queue full; dropping event");
                    }
                }
                Err(error) => log::warn!("malformed input command: {}", error),
            },
            Ok(WireMessage::NetFeedback { delta, fps }) => {
                dispatch_adaptive.lock().unwrap().apply_feedback(delta, fps);
            }
            Ok(WireMessage::ScreenshotRequest) => log::trace!("received screenshot pull request"),
            Ok(other) => log::warn!("unexpected message on controllee: {:?}", other),
            Err(error) => log::warn!("dropping malformed message: {}", error),
        }
    })?;

    let _ = receive_handle.join();
    running.store(false, Ordering::SeqCst);
    let _ = capture_handle.join();
    // input_tx was moved into the receive worker's closure above; once that
    // closure is dropped with the joined thread, input_rx's loop ends.
    let _ = input_handle.join();
    Ok(())
}

/// Runs the controller role to completion: decodes frame updates,
/// displays them, and forwards local input. `transport` is shared with the
/// caller so a Ctrl-C handler can force it closed.
pub fn run_controller(transport: Arc<Transport>) -> Result<()> {
    let (frame_tx, frame_rx) = mpsc::sync_channel(FRAME_CHANNEL_DEPTH);

    let send_transport = transport.clone();
    let render_transport = transport.clone();
    let mut pipeline = RenderPipeline::new(Box::new(JpegCodec::new()), frame_tx);
    let receive_handle = transport.spawn_receive_worker(move |payload| match WireMessage::decode(&payload) {
        Ok(message) => match pipeline.handle(message) {
            Ok(Some(feedback)) => {
                if let Err(error) = render_transport.send(feedback) {
                    log::warn!("could not send feedback: {}", error);
                }
            }
            Ok(None) => {}
            Err(error) => log::warn!("render pipeline error: {}", error),
        },
        Err(error) => log::warn!("dropping malformed message: {}", error),
    })?;

    send_transport.send(WireMessage::encode_send_screenshot())?;

    run_display_loop(frame_rx, send_transport)?;
    let _ = receive_handle.join();
    Ok(())
}

fn run_display_loop(
    frame_rx: std::sync::mpsc::Receiver<crate::render::FrameSnapshot>,
    transport: Arc<Transport>,
) -> Result<()> {
    use sdl2::event::Event;
    use sdl2::mouse::MouseButton;
    use std::sync::mpsc::RecvTimeoutError;
    use std::time::Duration;

    let mut display: Option<SdlDisplay> = None;
    let mut throttle = input::InputThrottle::new();
    let mut source_extent = (0u32, 0u32);
    let mut last_cursor = (0.0f64, 0.0f64);

    loop {
        if !transport.is_running() {
            return Ok(());
        }
        match frame_rx.recv_timeout(Duration::from_millis(5)) {
            Ok(snapshot) => {
                source_extent = (snapshot.width, snapshot.height);
                let surface = match &mut display {
                    Some(surface) => surface,
                    None => {
                        display = Some(SdlDisplay::new("deskstream", snapshot.width, snapshot.height)?);
                        display.as_mut().unwrap()
                    }
                };
                if let Err(error) = surface.set_frame(&snapshot.rgb, snapshot.width, snapshot.height) {
                    log::warn!("failed to present frame: {}", error);
                }
                if let Err(error) = transport.send(WireMessage::encode_send_screenshot()) {
                    log::warn!("could not request next frame: {}", error);
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }

        let Some(surface) = display.as_mut() else { continue };
        let displayed = surface.size();
        for event in surface.poll_events() {
            let input_event = match event {
                Event::Quit { .. } => return Ok(()),
                Event::MouseMotion { x, y, .. } => {
                    last_cursor = (x as f64, y as f64);
                    let (rx, ry) = input::displayed_to_relative(x as f64, y as f64, displayed, source_extent);
                    Some(InputEvent::MoveMouse { rx, ry })
                }
                Event::MouseButtonDown { mouse_btn, .. } => {
                    Some(InputEvent::MouseInput { is_left: mouse_btn == MouseButton::Left, is_down: true })
                }
                Event::MouseButtonUp { mouse_btn, .. } => {
                    Some(InputEvent::MouseInput { is_left: mouse_btn == MouseButton::Left, is_down: false })
                }
                Event::MouseWheel { x, y, .. } => {
                    let (rx, ry) = input::displayed_to_relative(last_cursor.0, last_cursor.1, displayed, source_extent);
                    Some(InputEvent::ScrollMouse {
                        rx,
                        ry,
                        direction: if y >= 0 { 1 } else { -1 },
                        amount: (y.abs() + x.abs()).max(1),
                    })
                }
                Event::KeyDown { scancode: Some(code), .. } => {
                    Some(InputEvent::KeyboardInput { keycode: code as u32, is_down: true })
                }
                Event::KeyUp { scancode: Some(code), .. } => {
                    Some(InputEvent::KeyboardInput { keycode: code as u32, is_down: false })
                }
                _ => None,
            };

            if let Some(event) = input_event {
                if throttle.should_send(&event) {
                    match WireMessage::encode_new_command(&event.to_args()) {
                        Ok(payload) => {
                            if let Err(error) = transport.send(payload) {
                                log::warn!("could not send input event: {}", error);
                            }
                        }
                        Err(error) => log::warn!("could not encode input event: {}", error),
                    }
                }
            }
        }
    }
}

//! The demo scene's vertex producer and the frame-rate meter the render
//! loop reports through.

use std::time::{Duration, Instant};

use gwgpu::vertex::Vertex;

/// Apex red, bottom-right green, bottom-left blue.
const TRIANGLE: [Vertex; 3] = [
    Vertex {
        pos: [0.0, -0.5],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        pos: [0.5, 0.5],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        pos: [-0.5, 0.5],
        color: [0.0, 0.0, 1.0],
    },
];

/// The same triangle plus a small satellite near the top-right corner.
const TRIANGLE_AND_SATELLITE: [Vertex; 6] = [
    Vertex {
        pos: [0.0, -0.5],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        pos: [0.5, 0.5],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        pos: [-0.5, 0.5],
        color: [0.0, 0.0, 1.0],
    },
    Vertex {
        pos: [0.6, -0.7],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        pos: [0.65, -0.65],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        pos: [0.55, -0.65],
        color: [0.0, 0.0, 0.0],
    },
];

/// Alternates between the lone triangle and the pair on every frame, so the
/// vertex count the renderer sees changes with each draw.
#[derive(Debug, Default)]
pub struct Scene {
    show_satellite: bool,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// The vertex list for the next frame.
    pub fn advance(&mut self) -> &'static [Vertex] {
        self.show_satellite = !self.show_satellite;
        if self.show_satellite {
            &TRIANGLE_AND_SATELLITE
        } else {
            &TRIANGLE
        }
    }
}

/// Rolling frames-per-second estimate, reported about once per second.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Instant,
    frames_in_window: u32,
}

impl FpsMeter {
    const REPORT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames_in_window: 0,
        }
    }

    /// Count one frame ending at `now`. Returns the average rate over the
    /// elapsed window once at least [`REPORT_INTERVAL`](Self::REPORT_INTERVAL)
    /// has passed, then starts a new window.
    pub fn record_frame(&mut self, now: Instant) -> Option<f64> {
        self.frames_in_window += 1;
        let elapsed = now.duration_since(self.window_start);
        if elapsed < Self::REPORT_INTERVAL {
            return None;
        }
        let fps = f64::from(self.frames_in_window) / elapsed.as_secs_f64();
        self.window_start = now;
        self.frames_in_window = 0;
        Some(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_alternates_between_six_and_three_vertices() {
        let mut scene = Scene::new();
        assert_eq!(scene.advance().len(), 6);
        assert_eq!(scene.advance().len(), 3);
        assert_eq!(scene.advance().len(), 6);
    }

    #[test]
    fn satellite_frames_start_with_the_base_triangle() {
        let mut scene = Scene::new();
        let pair = scene.advance();
        let lone = scene.advance();
        assert_eq!(&pair[..3], lone);
    }

    #[test]
    fn fps_meter_reports_once_per_window() {
        let t0 = Instant::now();
        let mut meter = FpsMeter::new(t0);

        for i in 1..=59u64 {
            assert_eq!(meter.record_frame(t0 + Duration::from_millis(i * 16)), None);
        }

        let report = meter
            .record_frame(t0 + Duration::from_millis(1000))
            .expect("a full second elapsed");
        assert!((report - 60.0).abs() < 0.5, "got {report}");

        // The window restarted, so the next frame is quiet again.
        assert_eq!(meter.record_frame(t0 + Duration::from_millis(1016)), None);
    }
}

/*!
Fixtures : images de pièces synthétiques et documents MTConnect

Les images sont en niveaux de gris 8 bits (ou RGB dérivé) avec des motifs
simples dont le verdict d'inspection est connu d'avance.
*/

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use millwatch_kernel::vision::Image;

/// Surface parfaitement uniforme
pub fn uniform_gray(width: usize, height: usize, value: u8) -> Image {
    gray(width, height, vec![value; width * height])
}

/// Fond uniforme + rectangle plein (tache, rayure...)
pub fn gray_with_rect(
    width: usize,
    height: usize,
    background: u8,
    rect: (usize, usize, usize, usize),
    value: u8,
) -> Image {
    let (x0, y0, rw, rh) = rect;
    let mut data = vec![background; width * height];
    for y in y0..(y0 + rh).min(height) {
        for x in x0..(x0 + rw).min(width) {
            data[y * width + x] = value;
        }
    }
    gray(width, height, data)
}

/// Pièce 200x200 grise avec une large tache sombre (défaut critique)
pub fn part_with_blob() -> Image {
    gray_with_rect(200, 200, 128, (60, 60, 80, 80), 20)
}

/// Pièce 200x60 grise avec une rayure claire horizontale
pub fn part_with_scratch() -> Image {
    gray_with_rect(200, 60, 128, (40, 28, 120, 3), 240)
}

/// Même image répliquée sur 3 canaux
pub fn to_rgb(image: &Image) -> Image {
    let gray = image.to_gray();
    let data: Vec<u8> = gray.pixels().iter().flat_map(|&p| [p, p, p]).collect();
    match Image::new(image.width(), image.height(), 3, data) {
        Ok(rgb) => rgb,
        Err(e) => panic!("fixture rgb image: {e}"),
    }
}

/// Pixels encodés comme attendu par POST /api/v1/quality/inspect
pub fn encode_pixels(image: &Image) -> String {
    STANDARD.encode(image.data())
}

fn gray(width: usize, height: usize, data: Vec<u8>) -> Image {
    match Image::gray(width, height, data) {
        Ok(img) => img,
        Err(e) => panic!("fixture image: {e}"),
    }
}

/// Document /current minimal pour un chemin d'usinage
#[derive(Debug, Clone, Default)]
pub struct CurrentDocument {
    pub execution: Option<String>,
    pub program: Option<String>,
    pub line: Option<u64>,
    pub spindle_speed: Option<f64>,
    pub feedrate: Option<f64>,
    pub x_position: Option<f64>,
    pub emergency_stop: Option<String>,
    pub faults: Vec<(String, String)>,
}

impl CurrentDocument {
    pub fn executing(execution: &str) -> Self {
        Self {
            execution: Some(execution.to_string()),
            ..Default::default()
        }
    }

    pub fn with_program(mut self, program: &str, line: u64) -> Self {
        self.program = Some(program.to_string());
        self.line = Some(line);
        self
    }

    pub fn with_spindle(mut self, rpm: f64) -> Self {
        self.spindle_speed = Some(rpm);
        self
    }

    pub fn with_fault(mut self, native_code: &str, text: &str) -> Self {
        self.faults.push((native_code.to_string(), text.to_string()));
        self
    }

    pub fn with_emergency_stop(mut self, value: &str) -> Self {
        self.emergency_stop = Some(value.to_string());
        self
    }

    pub fn to_xml(&self) -> String {
        let ts = r#"timestamp="2024-03-01T10:00:00Z""#;
        let mut linear = String::new();
        if let Some(x) = self.x_position {
            linear.push_str(&format!(r#"<Position dataItemId="xp" name="X" units="MILLIMETER" {ts}>{x}</Position>"#));
        }

        let mut rotary_samples = String::new();
        if let Some(rpm) = self.spindle_speed {
            rotary_samples.push_str(&format!(r#"<RotaryVelocity dataItemId="cs" {ts}>{rpm}</RotaryVelocity>"#));
        }
        let mut conditions = String::new();
        for (code, text) in &self.faults {
            conditions.push_str(&format!(
                r#"<Fault dataItemId="cc" type="SYSTEM" nativeCode="{code}" {ts}>{text}</Fault>"#
            ));
        }

        let mut path_samples = String::new();
        if let Some(f) = self.feedrate {
            path_samples.push_str(&format!(r#"<PathFeedrate dataItemId="pf" {ts}>{f}</PathFeedrate>"#));
        }
        let mut path_events = String::new();
        if let Some(exec) = &self.execution {
            path_events.push_str(&format!(r#"<Execution dataItemId="ex" {ts}>{exec}</Execution>"#));
        }
        if let Some(p) = &self.program {
            path_events.push_str(&format!(r#"<Program dataItemId="pg" {ts}>{p}</Program>"#));
        }
        if let Some(l) = self.line {
            path_events.push_str(&format!(r#"<Line dataItemId="ln" {ts}>{l}</Line>"#));
        }
        if let Some(e) = &self.emergency_stop {
            path_events.push_str(&format!(r#"<EmergencyStop dataItemId="es" {ts}>{e}</EmergencyStop>"#));
        }

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<MTConnectStreams xmlns="urn:mtconnect.org:MTConnectStreams:1.3">
  <Header creationTime="2024-03-01T10:00:00Z" sender="devkit" instanceId="1" version="1.3"/>
  <Streams>
    <DeviceStream name="devkit-mill" uuid="dk-1">
      <ComponentStream component="Linear" name="X" componentId="x"><Samples>{linear}</Samples></ComponentStream>
      <ComponentStream component="Rotary" name="C" componentId="c"><Samples>{rotary_samples}</Samples><Condition>{conditions}</Condition></ComponentStream>
      <ComponentStream component="Path" name="path" componentId="p"><Samples>{path_samples}</Samples><Events>{path_events}</Events></ComponentStream>
    </DeviceStream>
  </Streams>
</MTConnectStreams>"#
        )
    }
}

/// Réponse /probe minimale
pub const PROBE_DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MTConnectDevices xmlns="urn:mtconnect.org:MTConnectDevices:1.3">
  <Header creationTime="2024-03-01T10:00:00Z" sender="devkit" instanceId="1" version="1.3"/>
  <Devices><Device id="dk-1" name="devkit-mill" uuid="dk-1"/></Devices>
</MTConnectDevices>"#;

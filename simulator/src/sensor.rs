use rand::Rng;
use serde::Serialize;

/// Payload encodings accepted by the ingestor's decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    SnakeCase,
    CamelCase,
    Value,
    Bare,
}

impl PayloadShape {
    const ALL: [PayloadShape; 4] = [
        PayloadShape::SnakeCase,
        PayloadShape::CamelCase,
        PayloadShape::Value,
        PayloadShape::Bare,
    ];

    pub fn rotating(n: u64) -> Self {
        Self::ALL[(n % Self::ALL.len() as u64) as usize]
    }
}

#[derive(Serialize)]
struct SnakeCaseReading {
    alcohol_level: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CamelCaseReading {
    alcohol_level: i32,
}

#[derive(Serialize)]
struct ValueReading {
    value: i32,
}

pub fn encode(shape: PayloadShape, level: i32) -> Result<String, serde_json::Error> {
    match shape {
        PayloadShape::SnakeCase => serde_json::to_string(&SnakeCaseReading {
            alcohol_level: level,
        }),
        PayloadShape::CamelCase => serde_json::to_string(&CamelCaseReading {
            alcohol_level: level,
        }),
        PayloadShape::Value => serde_json::to_string(&ValueReading { value: level }),
        PayloadShape::Bare => Ok(level.to_string()),
    }
}

/// One simulated breath sensor. The level drifts around a baseline that is
/// either sober or drunk; a device occasionally switches between the two.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    pub device_id: String,
    pub topic: String,
    level: i32,
    drunk: bool,
    published: u64,
}

const SOBER_RANGE: (i32, i32) = (200, 1500);
const DRUNK_RANGE: (i32, i32) = (1700, 3200);

impl SimulatedSensor {
    pub fn new(device_id: String, topic_prefix: &str, drunk: bool) -> Self {
        let topic = format!("{}/{}", topic_prefix, device_id);
        let (low, high) = if drunk { DRUNK_RANGE } else { SOBER_RANGE };
        SimulatedSensor {
            device_id,
            topic,
            level: (low + high) / 2,
            drunk,
            published: 0,
        }
    }

    pub fn is_drunk(&self) -> bool {
        self.drunk
    }

    /// Next reading and the payload carrying it.
    pub fn next_payload(&mut self, rng: &mut impl Rng, drunk_ratio: f64) -> Result<(i32, String), serde_json::Error> {
        if rng.gen_bool(0.02) {
            self.drunk = rng.gen_bool(drunk_ratio.clamp(0.0, 1.0));
        }
        let (low, high) = if self.drunk { DRUNK_RANGE } else { SOBER_RANGE };
        self.level = (self.level + rng.gen_range(-120..=120)).clamp(low, high);

        let shape = PayloadShape::rotating(self.published);
        self.published += 1;
        Ok((self.level, encode(shape, self.level)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes() {
        assert_eq!(
            encode(PayloadShape::SnakeCase, 1800).unwrap(),
            r#"{"alcohol_level":1800}"#
        );
        assert_eq!(
            encode(PayloadShape::CamelCase, 1800).unwrap(),
            r#"{"alcoholLevel":1800}"#
        );
        assert_eq!(encode(PayloadShape::Value, 5).unwrap(), r#"{"value":5}"#);
        assert_eq!(encode(PayloadShape::Bare, 42).unwrap(), "42");
    }

    #[test]
    fn test_levels_stay_in_band() {
        let mut rng = rand::thread_rng();
        let mut sensor = SimulatedSensor::new("D1".into(), "sensors", true);
        assert_eq!(sensor.topic, "sensors/D1");
        for _ in 0..500 {
            let (level, _) = sensor.next_payload(&mut rng, 1.0).unwrap();
            assert!((DRUNK_RANGE.0..=DRUNK_RANGE.1).contains(&level));
        }
    }

    #[test]
    fn test_payload_shape_rotates() {
        let mut rng = rand::thread_rng();
        let mut sensor = SimulatedSensor::new("D1".into(), "sensors", false);
        let payloads: Vec<_> = (0..4)
            .map(|_| sensor.next_payload(&mut rng, 0.0).unwrap().1)
            .collect();
        assert!(payloads[0].contains("alcohol_level"));
        assert!(payloads[1].contains("alcoholLevel"));
        assert!(payloads[2].contains("value"));
        assert!(payloads[3].parse::<i32>().is_ok());
    }
}

//! Robot Drive Protocol
//!
//! Maps motor intents and gesture buttons onto the robot's text commands.
//!
//! ```text
//! STP                      stop both motors
//! F <speed>                both motors forward
//! B <speed>                both motors backward
//! TR <rightMag> <left>     right motor reversed, left forward
//! TL <right> <leftMag>     left motor reversed, right forward
//! SR <left>                pivot on the left motor (signed)
//! SL <right>               pivot on the right motor (signed)
//! ```
//!
//! Framing (the trailing CRLF) belongs to the transport layer.

use crate::domain::models::MotorIntent;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Gesture buttons on the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    Stop,
    Forward,
    Backward,
    TurnRight,
    TurnLeft,
    SpinRight,
    SpinLeft,
}

impl Gesture {
    pub const ALL: [Gesture; 7] = [
        Self::Stop,
        Self::Forward,
        Self::Backward,
        Self::TurnRight,
        Self::TurnLeft,
        Self::SpinRight,
        Self::SpinLeft,
    ];
}

/// A command in the robot's wire vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveCommand {
    Stop,
    Forward(u8),
    Backward(u8),
    TurnRight { right_mag: u8, left: u8 },
    TurnLeft { right: u8, left_mag: u8 },
    /// Carries the raw left speed, sign included.
    SpinRight(i8),
    /// Carries the raw right speed, sign included.
    SpinLeft(i8),
}

impl DriveCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Stop => "STP",
            Self::Forward(_) => "F",
            Self::Backward(_) => "B",
            Self::TurnRight { .. } => "TR",
            Self::TurnLeft { .. } => "TL",
            Self::SpinRight(_) => "SR",
            Self::SpinLeft(_) => "SL",
        }
    }
}

impl fmt::Display for DriveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = self.verb();
        match *self {
            Self::Stop => f.write_str(verb),
            Self::Forward(speed) | Self::Backward(speed) => write!(f, "{} {}", verb, speed),
            Self::TurnRight { right_mag, left } => write!(f, "{} {} {}", verb, right_mag, left),
            Self::TurnLeft { right, left_mag } => write!(f, "{} {} {}", verb, right, left_mag),
            Self::SpinRight(speed) | Self::SpinLeft(speed) => write!(f, "{} {}", verb, speed),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command verb: {0}")]
    UnknownVerb(String),
    #[error("{verb} expects {expected} argument(s), got {got}")]
    Arity {
        verb: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid speed field: {0}")]
    InvalidSpeed(String),
}

impl FromStr for DriveCommand {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let verb = fields.next().ok_or(ParseCommandError::Empty)?;
        let args: Vec<&str> = fields.collect();

        let (name, arity) = match verb {
            "STP" => ("STP", 0),
            "F" => ("F", 1),
            "B" => ("B", 1),
            "TR" => ("TR", 2),
            "TL" => ("TL", 2),
            "SR" => ("SR", 1),
            "SL" => ("SL", 1),
            other => return Err(ParseCommandError::UnknownVerb(other.to_string())),
        };
        if args.len() != arity {
            return Err(ParseCommandError::Arity {
                verb: name,
                expected: arity,
                got: args.len(),
            });
        }

        Ok(match name {
            "STP" => Self::Stop,
            "F" => Self::Forward(magnitude(args[0])?),
            "B" => Self::Backward(magnitude(args[0])?),
            "TR" => Self::TurnRight {
                right_mag: magnitude(args[0])?,
                left: magnitude(args[1])?,
            },
            "TL" => Self::TurnLeft {
                right: magnitude(args[0])?,
                left_mag: magnitude(args[1])?,
            },
            "SR" => Self::SpinRight(signed(args[0])?),
            _ => Self::SpinLeft(signed(args[0])?),
        })
    }
}

fn magnitude(field: &str) -> Result<u8, ParseCommandError> {
    match field.parse::<u8>() {
        Ok(value) if value as i32 <= MotorIntent::MAX_SPEED && !field.starts_with('+') => {
            Ok(value)
        }
        _ => Err(ParseCommandError::InvalidSpeed(field.to_string())),
    }
}

fn signed(field: &str) -> Result<i8, ParseCommandError> {
    match field.parse::<i8>() {
        Ok(value) if (value as i32).abs() <= MotorIntent::MAX_SPEED && !field.starts_with('+') => {
            Ok(value)
        }
        _ => Err(ParseCommandError::InvalidSpeed(field.to_string())),
    }
}

/// Outcome of a gesture: the command to send and the slider positions that
/// describe it, so the surface can mirror exactly what went on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoded {
    pub command: DriveCommand,
    pub sliders: MotorIntent,
}

/// Encodes a gesture against the current slider intent.
pub fn encode(gesture: Gesture, intent: MotorIntent) -> Encoded {
    let left = intent.left.unsigned_abs();
    let right = intent.right.unsigned_abs();

    match gesture {
        Gesture::Stop => Encoded {
            command: DriveCommand::Stop,
            sliders: MotorIntent::default(),
        },
        Gesture::Forward => {
            let speed = left.max(right);
            Encoded {
                command: DriveCommand::Forward(speed),
                sliders: MotorIntent::new(speed as i32, speed as i32),
            }
        }
        Gesture::Backward => {
            let speed = left.max(right);
            Encoded {
                command: DriveCommand::Backward(speed),
                sliders: MotorIntent::new(-(speed as i32), -(speed as i32)),
            }
        }
        Gesture::TurnRight => Encoded {
            command: DriveCommand::TurnRight {
                right_mag: right,
                left,
            },
            sliders: MotorIntent::new(left as i32, -(right as i32)),
        },
        Gesture::TurnLeft => Encoded {
            command: DriveCommand::TurnLeft {
                right,
                left_mag: left,
            },
            sliders: MotorIntent::new(-(left as i32), right as i32),
        },
        // The wire keeps the raw sign even though the slider snaps to |left|.
        Gesture::SpinRight => Encoded {
            command: DriveCommand::SpinRight(intent.left),
            sliders: MotorIntent::new(left as i32, 0),
        },
        Gesture::SpinLeft => Encoded {
            command: DriveCommand::SpinLeft(intent.right),
            sliders: MotorIntent::new(0, right as i32),
        },
    }
}

/// Wire text for a gesture, without framing.
pub fn encode_text(gesture: Gesture, intent: MotorIntent) -> String {
    encode(gesture, intent).command.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(gesture: Gesture, left: i32, right: i32) -> String {
        encode_text(gesture, MotorIntent::new(left, right))
    }

    #[test]
    fn test_stop() {
        assert_eq!(text(Gesture::Stop, 80, -20), "STP");
        assert_eq!(
            encode(Gesture::Stop, MotorIntent::new(80, -20)).sliders,
            MotorIntent::default()
        );
    }

    #[test]
    fn test_forward_backward_use_larger_magnitude() {
        assert_eq!(text(Gesture::Forward, 60, -60), "F 60");
        assert_eq!(text(Gesture::Forward, -60, -60), "F 60");
        assert_eq!(text(Gesture::Forward, 20, -75), "F 75");
        assert_eq!(text(Gesture::Backward, 60, -60), "B 60");
        assert_eq!(text(Gesture::Backward, -5, 30), "B 30");
        assert_eq!(text(Gesture::Forward, 0, 0), "F 0");
    }

    #[test]
    fn test_equal_magnitudes_encode_that_magnitude() {
        for speed in [0, 1, 37, 100] {
            for (l, r) in [(speed, speed), (speed, -speed), (-speed, speed), (-speed, -speed)] {
                assert_eq!(text(Gesture::Forward, l, r), format!("F {}", speed));
                assert_eq!(text(Gesture::Backward, l, r), format!("B {}", speed));
            }
        }
    }

    #[test]
    fn test_backward_sliders_are_negative() {
        let encoded = encode(Gesture::Backward, MotorIntent::new(45, 10));
        assert_eq!(encoded.sliders, MotorIntent::new(-45, -45));
    }

    #[test]
    fn test_turns() {
        assert_eq!(text(Gesture::TurnRight, 40, 70), "TR 70 40");
        assert_eq!(text(Gesture::TurnRight, -40, 70), "TR 70 40");
        assert_eq!(text(Gesture::TurnLeft, 40, 70), "TL 70 40");
        assert_eq!(text(Gesture::TurnLeft, 70, 40), "TL 40 70");

        let right = encode(Gesture::TurnRight, MotorIntent::new(40, 70));
        assert_eq!(right.sliders, MotorIntent::new(40, -70));
        let left = encode(Gesture::TurnLeft, MotorIntent::new(40, 70));
        assert_eq!(left.sliders, MotorIntent::new(-40, 70));
    }

    #[test]
    fn test_spins_keep_sign() {
        assert_eq!(text(Gesture::SpinRight, -30, 90), "SR -30");
        assert_eq!(text(Gesture::SpinRight, 30, 90), "SR 30");
        assert_eq!(text(Gesture::SpinLeft, 90, -55), "SL -55");

        let encoded = encode(Gesture::SpinRight, MotorIntent::new(-30, 90));
        assert_eq!(encoded.sliders, MotorIntent::new(30, 0));
        let encoded = encode(Gesture::SpinLeft, MotorIntent::new(90, -55));
        assert_eq!(encoded.sliders, MotorIntent::new(0, 55));
    }

    #[test]
    fn test_encoding_extremes() {
        assert_eq!(text(Gesture::Backward, -100, -100), "B 100");
        assert_eq!(text(Gesture::SpinLeft, 0, -100), "SL -100");
        assert_eq!(text(Gesture::TurnRight, 100, -100), "TR 100 100");
    }

    #[test]
    fn test_wire_text_parses_back() {
        let intents = [(40, 70), (-30, 55), (0, -100), (100, 0), (-7, -7)];
        for (l, r) in intents {
            let intent = MotorIntent::new(l, r);
            for gesture in Gesture::ALL {
                let encoded = encode(gesture, intent);
                let parsed: DriveCommand = encoded.command.to_string().parse().unwrap();
                assert_eq!(parsed, encoded.command, "{:?} {:?}", gesture, intent);
            }
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!("".parse::<DriveCommand>(), Err(ParseCommandError::Empty));
        assert!(matches!(
            "GO 10".parse::<DriveCommand>(),
            Err(ParseCommandError::UnknownVerb(_))
        ));
        assert!(matches!(
            "TR 10".parse::<DriveCommand>(),
            Err(ParseCommandError::Arity { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            "F -10".parse::<DriveCommand>(),
            Err(ParseCommandError::InvalidSpeed(_))
        ));
        assert!(matches!(
            "F 101".parse::<DriveCommand>(),
            Err(ParseCommandError::InvalidSpeed(_))
        ));
    }
}

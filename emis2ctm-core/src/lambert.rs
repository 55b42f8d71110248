//! Lambert conformal conic projection
//!
//! Pure Rust implementation of the one- and two-standard-parallel Lambert
//! conformal conic projection on an ellipsoid (or sphere), following the
//! formulation in Snyder, *Map Projections: A Working Manual* (USGS PP 1395),
//! equations 15-1 to 15-11 and 7-9.
//!
//! Projections are described with PROJ-style strings such as
//! `+proj=lcc +lat_1=25 +lat_2=40 +lat_0=34 +lon_0=110 +a=6370000 +b=6370000`.

use crate::errors::{EmissionError, EmissionResult};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

/// WGS84 semi-major axis (m)
pub const WGS84_A: f64 = 6378137.0;
/// WGS84 inverse flattening
pub const WGS84_RF: f64 = 298.257223563;
/// GRS80 inverse flattening
pub const GRS80_RF: f64 = 298.257222101;

const MAX_ITERATIONS: usize = 15;
const CONVERGENCE: f64 = 1e-12;

/// Parameters of a Lambert conformal conic projection, angles in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambertParams {
    pub lat_1: f64,
    pub lat_2: f64,
    pub lat_0: f64,
    pub lon_0: f64,
    /// False easting (m)
    pub x_0: f64,
    /// False northing (m)
    pub y_0: f64,
    /// Semi-major axis (m)
    pub a: f64,
    /// Semi-minor axis (m)
    pub b: f64,
}

impl LambertParams {
    /// Parse a PROJ-style definition string.
    ///
    /// Only `+proj=lcc` is accepted. Unknown keys (`+no_defs`, `+datum`, ...)
    /// are ignored the way PROJ ignores them.
    pub fn from_proj_str(definition: &str) -> EmissionResult<Self> {
        let mut proj = None;
        let mut lat_1 = None;
        let mut lat_2 = None;
        let mut lat_0 = 0.0;
        let mut lon_0 = 0.0;
        let mut x_0 = 0.0;
        let mut y_0 = 0.0;
        let mut radius = None;
        let mut a = None;
        let mut b = None;
        let mut rf = None;
        let mut ellps = None;

        for token in definition.split_whitespace() {
            let token = token.trim_start_matches('+');
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, value),
                None => (token, ""),
            };
            let number = || {
                value.parse::<f64>().map_err(|_| {
                    EmissionError::Projection(format!(
                        "invalid value '{}' for +{} in '{}'",
                        value, key, definition
                    ))
                })
            };
            match key {
                "proj" => proj = Some(value.to_string()),
                "lat_1" => lat_1 = Some(number()?),
                "lat_2" => lat_2 = Some(number()?),
                "lat_0" => lat_0 = number()?,
                "lon_0" => lon_0 = number()?,
                "x_0" => x_0 = number()?,
                "y_0" => y_0 = number()?,
                "R" => radius = Some(number()?),
                "a" => a = Some(number()?),
                "b" => b = Some(number()?),
                "rf" => rf = Some(number()?),
                "ellps" => ellps = Some(value.to_string()),
                "units" if value != "m" => {
                    return Err(EmissionError::Projection(format!(
                        "unsupported units '{}', only metres are supported",
                        value
                    )))
                }
                _ => {}
            }
        }

        match proj.as_deref() {
            Some("lcc") => {}
            Some(other) => {
                return Err(EmissionError::Projection(format!(
                    "unsupported projection '{}', only 'lcc' is supported",
                    other
                )))
            }
            None => {
                return Err(EmissionError::Projection(format!(
                    "missing +proj in '{}'",
                    definition
                )))
            }
        }

        let lat_1 = lat_1.ok_or_else(|| {
            EmissionError::Projection(format!("missing +lat_1 in '{}'", definition))
        })?;
        let lat_2 = lat_2.unwrap_or(lat_1);

        let (a, b) = match (radius, a, b, rf) {
            (Some(r), _, _, _) => (r, r),
            (None, Some(a), Some(b), _) => (a, b),
            (None, Some(a), None, Some(rf)) => (a, a * (1.0 - 1.0 / rf)),
            (None, Some(a), None, None) => (a, a),
            (None, None, _, _) => match ellps.as_deref().unwrap_or("WGS84") {
                "WGS84" => (WGS84_A, WGS84_A * (1.0 - 1.0 / WGS84_RF)),
                "GRS80" => (WGS84_A, WGS84_A * (1.0 - 1.0 / GRS80_RF)),
                "sphere" => (6370997.0, 6370997.0),
                other => {
                    return Err(EmissionError::Projection(format!(
                        "unsupported ellipsoid '{}'",
                        other
                    )))
                }
            },
        };

        Ok(Self {
            lat_1,
            lat_2,
            lat_0,
            lon_0,
            x_0,
            y_0,
            a,
            b,
        })
    }
}

/// A Lambert conformal conic projection ready for coordinate transforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambertConformal {
    params: LambertParams,
    /// First eccentricity
    e: f64,
    /// Cone constant
    n: f64,
    /// Semi-major axis multiplied by the mapping constant F
    a_f: f64,
    rho_0: f64,
}

impl LambertConformal {
    pub fn new(params: LambertParams) -> EmissionResult<Self> {
        let LambertParams { a, b, .. } = params;
        if !(a > 0.0 && b > 0.0 && b <= a) {
            return Err(EmissionError::Projection(format!(
                "invalid ellipsoid axes a={} b={}",
                a, b
            )));
        }
        if (params.lat_1 + params.lat_2).abs() < 1e-10 {
            return Err(EmissionError::Projection(
                "standard parallels must not be symmetric about the equator".to_string(),
            ));
        }

        let e = ((a * a - b * b) / (a * a)).sqrt();
        let phi_1 = params.lat_1.to_radians();
        let phi_2 = params.lat_2.to_radians();

        let m_1 = m(phi_1, e);
        let t_1 = t(phi_1, e);
        let n = if (phi_1 - phi_2).abs() > 1e-10 {
            (m_1.ln() - m(phi_2, e).ln()) / (t_1.ln() - t(phi_2, e).ln())
        } else {
            phi_1.sin()
        };
        let a_f = a * m_1 / (n * t_1.powf(n));
        let rho_0 = a_f * t(params.lat_0.to_radians(), e).powf(n);

        Ok(Self {
            params,
            e,
            n,
            a_f,
            rho_0,
        })
    }

    pub fn from_proj_str(definition: &str) -> EmissionResult<Self> {
        Self::new(LambertParams::from_proj_str(definition)?)
    }

    pub fn params(&self) -> &LambertParams {
        &self.params
    }

    /// Project geographic coordinates (degrees) to projected metres
    pub fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let rho = self.a_f * t(lat.to_radians(), self.e).powf(self.n);
        let theta = self.n * wrap_pi((lon - self.params.lon_0).to_radians());
        (
            self.params.x_0 + rho * theta.sin(),
            self.params.y_0 + self.rho_0 - rho * theta.cos(),
        )
    }

    /// Convert projected metres back to geographic `(lon, lat)` in degrees
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x - self.params.x_0;
        let dy = self.rho_0 - (y - self.params.y_0);
        let sign = self.n.signum();

        let rho = sign * (dx * dx + dy * dy).sqrt();
        if rho == 0.0 {
            return (self.params.lon_0, sign * 90.0);
        }
        let theta = (sign * dx).atan2(sign * dy);
        let t = (rho / self.a_f).powf(1.0 / self.n);

        let mut phi = FRAC_PI_2 - 2.0 * t.atan();
        for _ in 0..MAX_ITERATIONS {
            let es = self.e * phi.sin();
            let next = FRAC_PI_2 - 2.0 * (t * ((1.0 - es) / (1.0 + es)).powf(self.e / 2.0)).atan();
            let delta = (next - phi).abs();
            phi = next;
            if delta < CONVERGENCE {
                break;
            }
        }

        let lambda = wrap_pi(theta / self.n + self.params.lon_0.to_radians());
        (lambda.to_degrees(), phi.to_degrees())
    }
}

fn m(phi: f64, e: f64) -> f64 {
    let es = e * phi.sin();
    phi.cos() / (1.0 - es * es).sqrt()
}

fn t(phi: f64, e: f64) -> f64 {
    let es = e * phi.sin();
    (FRAC_PI_4 - phi / 2.0).tan() / ((1.0 - es) / (1.0 + es)).powf(e / 2.0)
}

fn wrap_pi(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI {
        PI
    } else {
        wrapped
    }
}

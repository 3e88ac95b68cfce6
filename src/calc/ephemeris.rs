//! Low-precision reference calculator.
//!
//! [`MeanEphemeris`] places the Sun, Moon and planets at their mean
//! longitudes (linear in time from J2000.0), derives the ascendant and
//! midheaven from local sidereal time, and uses equal houses. Accuracy is
//! a few degrees: enough to exercise the serving layer end to end with a
//! deterministic, non-trivial workload, not to cast real charts.
//!
//! Civil time is read as local mean time at the subject's longitude when
//! coordinates are present, and as UT otherwise.

use serde::Serialize;

use super::{CalculationError, Calculator};
use crate::types::{BirthData, ChartOptions, ComputeRequest, Moment, TransitOptions};

const J2000: f64 = 2_451_545.0;

const SIGNS: [&str; 12] = [
    "Aries",
    "Taurus",
    "Gemini",
    "Cancer",
    "Leo",
    "Virgo",
    "Libra",
    "Scorpio",
    "Sagittarius",
    "Capricorn",
    "Aquarius",
    "Pisces",
];

/// (name, mean longitude at J2000 in degrees, degrees per day)
const BODIES: [(&str, f64, f64); 10] = [
    ("Sun", 280.460, 0.985_647_4),
    ("Moon", 218.316, 13.176_396),
    ("Mercury", 252.251, 4.092_339),
    ("Venus", 181.980, 1.602_131),
    ("Mars", 355.433, 0.524_033),
    ("Jupiter", 34.351, 0.083_091),
    ("Saturn", 50.077, 0.033_459),
    ("Uranus", 314.055, 0.011_733),
    ("Neptune", 304.349, 0.005_981),
    ("Pluto", 238.929, 0.003_968),
];

/// (name, exact angle, natal orb)
const ASPECTS: [(&str, f64, f64); 5] = [
    ("conjunction", 0.0, 8.0),
    ("sextile", 60.0, 6.0),
    ("square", 90.0, 7.0),
    ("trine", 120.0, 8.0),
    ("opposition", 180.0, 8.0),
];

/// Mean-longitude calculator with equal houses.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanEphemeris;

impl MeanEphemeris {
    pub fn new() -> Self {
        Self
    }
}

impl Calculator for MeanEphemeris {
    fn name(&self) -> &str {
        "mean-ephemeris"
    }

    fn compute(&self, request: &ComputeRequest) -> Result<serde_json::Value, CalculationError> {
        let value = match request {
            ComputeRequest::Subject(subject) => serde_json::to_value(subject_chart(subject)?)?,
            ComputeRequest::NatalChart { subject, options } => {
                serde_json::to_value(natal_chart(subject, options)?)?
            }
            ComputeRequest::Transits { natal, options } => {
                serde_json::to_value(transits(natal, options)?)?
            }
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, Serialize)]
struct Position {
    name: &'static str,
    longitude: f64,
    sign: &'static str,
    degree: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    house: Option<u8>,
}

impl Position {
    fn new(name: &'static str, longitude: f64, ascendant: Option<f64>) -> Self {
        let longitude = normalize(longitude);
        Self {
            name,
            longitude,
            sign: SIGNS[sign_index(longitude)],
            degree: longitude % 30.0,
            house: ascendant.map(|asc| house_of(longitude, asc)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HouseCusp {
    number: u8,
    longitude: f64,
    sign: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct Location<'a> {
    city: &'a str,
    nation: &'a str,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Clone, Serialize)]
struct SubjectChart<'a> {
    name: &'a str,
    julian_day: f64,
    location: Location<'a>,
    ascendant: Position,
    midheaven: Position,
    planets: Vec<Position>,
    houses: Vec<HouseCusp>,
}

#[derive(Debug, Clone, Serialize)]
struct Aspect {
    first: &'static str,
    second: &'static str,
    aspect: &'static str,
    orb: f64,
}

#[derive(Debug, Clone, Serialize)]
struct NatalChart<'a> {
    chart_type: &'a str,
    house_system: &'a str,
    houses_used: &'static str,
    subject: SubjectChart<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aspects: Option<Vec<Aspect>>,
}

#[derive(Debug, Clone, Serialize)]
struct Transit {
    transiting: &'static str,
    natal: &'static str,
    aspect: &'static str,
    orb: f64,
    transiting_longitude: f64,
}

#[derive(Debug, Clone, Serialize)]
struct TransitReport<'a> {
    natal: &'a str,
    moment: Moment,
    orb_limit: f64,
    transits: Vec<Transit>,
}

fn subject_chart(subject: &BirthData) -> Result<SubjectChart<'_>, CalculationError> {
    let moment = subject.moment();
    validate_moment(&moment)?;
    let latitude = subject.latitude.unwrap_or(0.0);
    let longitude = subject.longitude.unwrap_or(0.0);
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(CalculationError::new(format!(
            "coordinates out of range: {latitude}, {longitude}"
        )));
    }

    let jd = julian_day(&moment) - longitude / 360.0;
    let d = jd - J2000;
    let (asc, mc) = angles(d, latitude, longitude);

    let planets = BODIES
        .iter()
        .map(|&(name, l0, rate)| Position::new(name, l0 + rate * d, Some(asc)))
        .collect();
    let houses = (0..12u8)
        .map(|i| {
            let cusp = normalize(asc + 30.0 * f64::from(i));
            HouseCusp {
                number: i + 1,
                longitude: cusp,
                sign: SIGNS[sign_index(cusp)],
            }
        })
        .collect();

    Ok(SubjectChart {
        name: &subject.name,
        julian_day: jd,
        location: Location {
            city: &subject.city,
            nation: &subject.nation,
            latitude,
            longitude,
        },
        ascendant: Position::new("Ascendant", asc, None),
        midheaven: Position::new("Midheaven", mc, None),
        planets,
        houses,
    })
}

fn natal_chart<'a>(
    subject: &'a BirthData,
    options: &'a ChartOptions,
) -> Result<NatalChart<'a>, CalculationError> {
    let chart = subject_chart(subject)?;
    let aspects = options.include_aspects.then(|| {
        let mut found = Vec::new();
        for (i, a) in chart.planets.iter().enumerate() {
            for b in &chart.planets[i + 1..] {
                if let Some((aspect, orb)) = closest_aspect(a.longitude, b.longitude, None) {
                    found.push(Aspect {
                        first: a.name,
                        second: b.name,
                        aspect,
                        orb,
                    });
                }
            }
        }
        found
    });

    Ok(NatalChart {
        chart_type: &options.chart_type,
        house_system: &options.house_system,
        houses_used: "equal",
        subject: chart,
        aspects,
    })
}

fn transits<'a>(
    natal: &'a BirthData,
    options: &TransitOptions,
) -> Result<TransitReport<'a>, CalculationError> {
    if !(options.orb_limit.is_finite() && options.orb_limit >= 0.0) {
        return Err(CalculationError::new(format!(
            "orb limit must be a non-negative number, got {}",
            options.orb_limit
        )));
    }
    validate_moment(&options.moment)?;

    let filter = match &options.planets {
        Some(names) => {
            let mut selected = Vec::with_capacity(names.len());
            for name in names {
                let body = BODIES
                    .iter()
                    .find(|(b, _, _)| b.eq_ignore_ascii_case(name.trim()))
                    .ok_or_else(|| CalculationError::new(format!("unknown planet '{name}'")))?;
                selected.push(body.0);
            }
            Some(selected)
        }
        None => None,
    };

    let chart = subject_chart(natal)?;
    let d = julian_day(&options.moment) - J2000;

    let mut found = Vec::new();
    for &(name, l0, rate) in BODIES.iter() {
        if filter.as_ref().is_some_and(|f| !f.contains(&name)) {
            continue;
        }
        let transiting = normalize(l0 + rate * d);
        for natal_body in &chart.planets {
            if let Some((aspect, orb)) =
                closest_aspect(transiting, natal_body.longitude, Some(options.orb_limit))
            {
                found.push(Transit {
                    transiting: name,
                    natal: natal_body.name,
                    aspect,
                    orb,
                    transiting_longitude: transiting,
                });
            }
        }
    }

    Ok(TransitReport {
        natal: &natal.name,
        moment: options.moment,
        orb_limit: options.orb_limit,
        transits: found,
    })
}

fn validate_moment(m: &Moment) -> Result<(), CalculationError> {
    if !(-3000..=3000).contains(&m.year) {
        return Err(CalculationError::new(format!("year {} out of range", m.year)));
    }
    if !(1..=12).contains(&m.month) {
        return Err(CalculationError::new(format!("invalid month {}", m.month)));
    }
    if m.day == 0 || m.day > days_in_month(m.year, m.month) {
        return Err(CalculationError::new(format!(
            "invalid day {} for {}-{:02}",
            m.day, m.year, m.month
        )));
    }
    if m.hour > 23 || m.minute > 59 {
        return Err(CalculationError::new(format!(
            "invalid time {:02}:{:02}",
            m.hour, m.minute
        )));
    }
    Ok(())
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        2 if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Julian day (Gregorian calendar) of a civil moment read as UT.
fn julian_day(m: &Moment) -> f64 {
    let (mut y, mut mo) = (f64::from(m.year), f64::from(m.month));
    if m.month <= 2 {
        y -= 1.0;
        mo += 12.0;
    }
    let a = (y / 100.0).floor();
    let b = 2.0 - a + (a / 4.0).floor();
    let day_fraction = (f64::from(m.hour) + f64::from(m.minute) / 60.0) / 24.0;
    (365.25 * (y + 4716.0)).floor() + (30.6001 * (mo + 1.0)).floor() + f64::from(m.day) + b
        - 1524.5
        + day_fraction
}

/// Ascendant and midheaven for `d` days from J2000 at the given place.
fn angles(d: f64, latitude: f64, longitude: f64) -> (f64, f64) {
    let obliquity = (23.4393 - 0.000_000_4 * d).to_radians();
    let ramc = normalize(280.460_618_37 + 360.985_647_366_29 * d + longitude).to_radians();
    let phi = latitude.clamp(-89.9, 89.9).to_radians();

    let asc = ramc
        .cos()
        .atan2(-(ramc.sin() * obliquity.cos() + phi.tan() * obliquity.sin()));
    let mc = ramc.sin().atan2(ramc.cos() * obliquity.cos());
    (normalize(asc.to_degrees()), normalize(mc.to_degrees()))
}

/// Closest major aspect between two longitudes within `orb_limit`
/// (or each aspect's natal orb when no limit is given).
fn closest_aspect(a: f64, b: f64, orb_limit: Option<f64>) -> Option<(&'static str, f64)> {
    let mut separation = (a - b).abs() % 360.0;
    if separation > 180.0 {
        separation = 360.0 - separation;
    }
    ASPECTS
        .iter()
        .map(|(name, angle, natal_orb)| (*name, (separation - angle).abs(), *natal_orb))
        .filter(|(_, orb, natal_orb)| *orb <= orb_limit.unwrap_or(*natal_orb))
        .min_by(|x, y| x.1.total_cmp(&y.1))
        .map(|(name, orb, _)| (name, orb))
}

fn normalize(degrees: f64) -> f64 {
    degrees.rem_euclid(360.0)
}

fn sign_index(longitude: f64) -> usize {
    ((longitude / 30.0) as usize).min(11)
}

fn house_of(longitude: f64, ascendant: f64) -> u8 {
    let offset = normalize(longitude - ascendant);
    ((offset / 30.0) as u8).min(11) + 1
}

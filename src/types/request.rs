//! Compute request types.

use serde::{Deserialize, Serialize};

/// The kind of computation requested.
///
/// Each operation has its own TTL (see [`TtlPolicy`](crate::cache::TtlPolicy))
/// and its own key namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Planet, house and aspect positions for one subject.
    Subject,
    /// A natal chart for one subject.
    NatalChart,
    /// Transits of a moment over a natal subject.
    Transits,
}

impl Operation {
    /// All operations, in declaration order.
    pub const ALL: [Operation; 3] = [Self::Subject, Self::NatalChart, Self::Transits];

    /// Stable name used in cache keys, metric labels and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::NatalChart => "natal-chart",
            Self::Transits => "transits",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A civil date and time at minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moment {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl Moment {
    pub fn new(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
        }
    }
}

/// Birth data identifying an astrological subject.
///
/// ```rust
/// # use orrery::BirthData;
/// let subject = BirthData::new("Ada", 1815, 12, 10, 12, 0)
///     .place("London", "GB")
///     .coordinates(51.5074, -0.1278)
///     .timezone("Europe/London");
/// assert_eq!(subject.nation, "GB");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BirthData {
    pub name: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub city: String,
    /// ISO 3166-1 alpha-2 country code.
    pub nation: String,
    /// IANA timezone name. `None` means the calculator's default.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl BirthData {
    pub fn new(name: impl Into<String>, year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Self {
        Self {
            name: name.into(),
            year,
            month,
            day,
            hour,
            minute,
            city: String::new(),
            nation: String::new(),
            timezone: None,
            latitude: None,
            longitude: None,
        }
    }

    /// Set city and nation.
    pub fn place(mut self, city: impl Into<String>, nation: impl Into<String>) -> Self {
        self.city = city.into();
        self.nation = nation.into();
        self
    }

    /// Set geographic coordinates in decimal degrees.
    pub fn coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    /// Set the IANA timezone.
    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    /// Birth moment.
    pub fn moment(&self) -> Moment {
        Moment::new(self.year, self.month, self.day, self.hour, self.minute)
    }
}

/// Output-shaping options for natal charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartOptions {
    /// Chart type. Default: "natal".
    pub chart_type: String,
    /// House system. Default: "Placidus".
    pub house_system: String,
    /// Whether aspects are included. Default: true.
    pub include_aspects: bool,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            chart_type: "natal".to_string(),
            house_system: "Placidus".to_string(),
            include_aspects: true,
        }
    }
}

/// Options for transit calculations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitOptions {
    /// The moment whose planets transit the natal chart.
    pub moment: Moment,
    /// Maximum orb in degrees. Default: 5.0.
    pub orb_limit: f64,
    /// Restrict to these transiting planets. `None` means all.
    #[serde(default)]
    pub planets: Option<Vec<String>>,
}

impl TransitOptions {
    pub fn at(moment: Moment) -> Self {
        Self {
            moment,
            orb_limit: 5.0,
            planets: None,
        }
    }

    /// Set the maximum orb.
    pub fn orb_limit(mut self, orb: f64) -> Self {
        self.orb_limit = orb;
        self
    }

    /// Restrict the transiting planets.
    pub fn planets<I, S>(mut self, planets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.planets = Some(planets.into_iter().map(Into::into).collect());
        self
    }
}

/// A request for one computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum ComputeRequest {
    Subject(BirthData),
    NatalChart {
        subject: BirthData,
        #[serde(default)]
        options: ChartOptions,
    },
    Transits {
        natal: BirthData,
        options: TransitOptions,
    },
}

impl ComputeRequest {
    pub fn subject(subject: BirthData) -> Self {
        Self::Subject(subject)
    }

    pub fn natal_chart(subject: BirthData, options: ChartOptions) -> Self {
        Self::NatalChart { subject, options }
    }

    pub fn transits(natal: BirthData, options: TransitOptions) -> Self {
        Self::Transits { natal, options }
    }

    /// Which operation this request performs.
    pub fn operation(&self) -> Operation {
        match self {
            Self::Subject(_) => Operation::Subject,
            Self::NatalChart { .. } => Operation::NatalChart,
            Self::Transits { .. } => Operation::Transits,
        }
    }

    /// The (natal) subject the request is about.
    pub fn birth_data(&self) -> &BirthData {
        match self {
            Self::Subject(subject) => subject,
            Self::NatalChart { subject, .. } => subject,
            Self::Transits { natal, .. } => natal,
        }
    }
}

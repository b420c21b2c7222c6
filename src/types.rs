#[derive(Clone, Debug, PartialEq)]
pub struct Place {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// Terminal result of one capture cycle, sent over the channel to the
/// websocket task for publishing.
#[derive(Debug)]
pub enum LookupOutcome {
    Selected {
        place: Place,
        image_url: Option<String>,
    },
    /// The model answered but nothing in the dataset was close enough.
    /// The raw label is kept so the user still learns what was detected.
    Unresolved { label: String },
    Failed { message: String },
}

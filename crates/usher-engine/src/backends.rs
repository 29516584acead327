//! In-process data boundaries for the business tools. The production system
//! may back these with CSV files, a CRM, or a calendar service; the core only
//! sees the traits.

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

// ── Customer directory ──

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: String,
    pub company_name: String,
    pub name: String,
    pub domain: String,
    pub email: String,
    pub phone: String,
    pub request_date: String,
    pub request_summary: String,
}

/// Profile data captured at onboarding, before an id is assigned.
#[derive(Clone, Debug, Deserialize)]
pub struct NewCustomer {
    pub company_name: String,
    pub name: String,
    #[serde(default)]
    pub domain: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub request_date: String,
    #[serde(default)]
    pub request_summary: String,
}

pub trait CustomerDirectory: Send + Sync {
    fn find_by_email(&self, email: &str) -> Result<Option<CustomerRecord>, BackendError>;
    fn insert(&self, profile: NewCustomer) -> Result<CustomerRecord, BackendError>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    records: Mutex<Vec<CustomerRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CustomerDirectory for InMemoryDirectory {
    fn find_by_email(&self, email: &str) -> Result<Option<CustomerRecord>, BackendError> {
        Ok(self
            .records
            .lock()
            .iter()
            .find(|r| r.email == email)
            .cloned())
    }

    fn insert(&self, profile: NewCustomer) -> Result<CustomerRecord, BackendError> {
        let mut records = self.records.lock();
        let record = CustomerRecord {
            customer_id: format!("CUST-{:03}", records.len() + 1),
            company_name: profile.company_name,
            name: profile.name,
            domain: profile.domain,
            email: profile.email,
            phone: profile.phone,
            request_date: profile.request_date,
            request_summary: profile.request_summary,
        };
        records.push(record.clone());
        Ok(record)
    }
}

// ── Appointment book ──

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Appointment {
    pub appointment_id: String,
    pub specialist_id: String,
    pub customer_id: String,
    pub start: NaiveDateTime,
    pub duration_minutes: u32,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct BookingRequest {
    pub specialist_id: String,
    pub customer_id: String,
    pub start: NaiveDateTime,
    pub reason: String,
    /// Stable across retries of the same logical booking.
    pub dedup_token: String,
}

pub trait AppointmentBook: Send + Sync {
    fn is_booked(&self, specialist_id: &str, start: NaiveDateTime) -> Result<bool, BackendError>;

    /// The appointment previously created under this dedup token, if any.
    fn find_by_token(&self, token: &str) -> Result<Option<Appointment>, BackendError>;

    /// Book a slot. A request repeating an already-seen dedup token returns
    /// the existing appointment instead of creating a second one.
    fn book(&self, request: BookingRequest) -> Result<Appointment, BackendError>;
}

#[derive(Default)]
pub struct InMemoryAppointmentBook {
    entries: Mutex<Vec<(String, Appointment)>>,
}

impl InMemoryAppointmentBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl AppointmentBook for InMemoryAppointmentBook {
    fn is_booked(&self, specialist_id: &str, start: NaiveDateTime) -> Result<bool, BackendError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .any(|(_, a)| a.specialist_id == specialist_id && a.start == start))
    }

    fn find_by_token(&self, token: &str) -> Result<Option<Appointment>, BackendError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, a)| a.clone()))
    }

    fn book(&self, request: BookingRequest) -> Result<Appointment, BackendError> {
        let mut entries = self.entries.lock();

        if let Some((_, existing)) = entries.iter().find(|(t, _)| *t == request.dedup_token) {
            return Ok(existing.clone());
        }

        let appointment = Appointment {
            appointment_id: format!("APT-{}", 1000 + entries.len()),
            specialist_id: request.specialist_id,
            customer_id: request.customer_id,
            start: request.start,
            duration_minutes: 30,
            reason: request.reason,
        };
        entries.push((request.dedup_token, appointment.clone()));
        Ok(appointment)
    }
}

// ── Specialist roster ──

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Specialist {
    pub specialist_id: String,
    pub name: String,
    pub title: String,
    pub products: Vec<String>,
    pub skills: Vec<String>,
    pub industries: Vec<String>,
}

pub trait SpecialistRoster: Send + Sync {
    fn all(&self) -> Result<Vec<Specialist>, BackendError>;
}

pub struct InMemoryRoster {
    specialists: Vec<Specialist>,
}

impl InMemoryRoster {
    pub fn new(specialists: Vec<Specialist>) -> Self {
        Self { specialists }
    }
}

impl SpecialistRoster for InMemoryRoster {
    fn all(&self) -> Result<Vec<Specialist>, BackendError> {
        Ok(self.specialists.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn profile(email: &str) -> NewCustomer {
        NewCustomer {
            company_name: "Acme GmbH".into(),
            name: "Dana".into(),
            domain: "logistics".into(),
            email: email.into(),
            phone: String::new(),
            request_date: "2026-03-01".into(),
            request_summary: "migration inquiry".into(),
        }
    }

    #[test]
    fn directory_assigns_sequential_ids() {
        let dir = InMemoryDirectory::new();
        let a = dir.insert(profile("a@acme.test")).unwrap();
        let b = dir.insert(profile("b@acme.test")).unwrap();
        assert_eq!(a.customer_id, "CUST-001");
        assert_eq!(b.customer_id, "CUST-002");
    }

    #[test]
    fn directory_find_by_email() {
        let dir = InMemoryDirectory::new();
        dir.insert(profile("a@acme.test")).unwrap();
        assert!(dir.find_by_email("a@acme.test").unwrap().is_some());
        assert!(dir.find_by_email("missing@acme.test").unwrap().is_none());
    }

    fn slot(h: u32) -> NaiveDateTime {
        // 2026-03-02 is a Monday
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn booking(token: &str) -> BookingRequest {
        BookingRequest {
            specialist_id: "PS-301".into(),
            customer_id: "CUST-001".into(),
            start: slot(11),
            reason: "cloud migration planning".into(),
            dedup_token: token.into(),
        }
    }

    #[test]
    fn book_marks_slot_taken() {
        let book = InMemoryAppointmentBook::new();
        assert!(!book.is_booked("PS-301", slot(11)).unwrap());
        let apt = book.book(booking("sess_1:0")).unwrap();
        assert_eq!(apt.appointment_id, "APT-1000");
        assert!(book.is_booked("PS-301", slot(11)).unwrap());
        assert!(!book.is_booked("PS-302", slot(11)).unwrap());
    }

    #[test]
    fn repeated_dedup_token_returns_same_appointment() {
        let book = InMemoryAppointmentBook::new();
        let first = book.book(booking("sess_1:0")).unwrap();
        let second = book.book(booking("sess_1:0")).unwrap();
        assert_eq!(first.appointment_id, second.appointment_id);
        assert_eq!(book.count(), 1);
    }

    #[test]
    fn distinct_tokens_create_distinct_appointments() {
        let book = InMemoryAppointmentBook::new();
        let first = book.book(booking("sess_1:0")).unwrap();
        let mut second_req = booking("sess_1:4");
        second_req.start = slot(12);
        let second = book.book(second_req).unwrap();
        assert_ne!(first.appointment_id, second.appointment_id);
        assert_eq!(book.count(), 2);
    }
}

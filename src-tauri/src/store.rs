//! Состояние приложения: пользователь, флаг входа, текущий экран.
//! Контейнер создаётся явно и передаётся владельцу (Tauri state),
//! глобальных синглтонов нет. [`SharedStore`] сохраняет снимок после
//! каждого изменения.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ключ, под которым хранится снимок состояния
pub const STORAGE_KEY: &str = "mediconnect-storage";

const SNAPSHOT_VERSION: u32 = 0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to serialize app state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to restore app state: {0}")]
    Restore(#[source] serde_json::Error),
    #[error("unsupported app state version {0}")]
    Version(u32),
    #[error("failed to write app state: {0}")]
    Io(#[from] io::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum Screen {
    #[default]
    Home,
    Login,
    Signup,
    Onboarding,
    MainTab,
    Profile,
    Settings,
    AiDiagnosis,
    VideoCall,
    AppointmentBooking,
    MedicalRecords,
    Payment,
}

impl Screen {
    pub const ALL: [Screen; 12] = [
        Screen::Home,
        Screen::Login,
        Screen::Signup,
        Screen::Onboarding,
        Screen::MainTab,
        Screen::Profile,
        Screen::Settings,
        Screen::AiDiagnosis,
        Screen::VideoCall,
        Screen::AppointmentBooking,
        Screen::MedicalRecords,
        Screen::Payment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Screen::Home => "home",
            Screen::Login => "login",
            Screen::Signup => "signup",
            Screen::Onboarding => "onboarding",
            Screen::MainTab => "mainTab",
            Screen::Profile => "profile",
            Screen::Settings => "settings",
            Screen::AiDiagnosis => "aiDiagnosis",
            Screen::VideoCall => "videoCall",
            Screen::AppointmentBooking => "appointmentBooking",
            Screen::MedicalRecords => "medicalRecords",
            Screen::Payment => "payment",
        }
    }

    /// Экран доступен только вошедшему пользователю.
    /// Проверяет только хранилище: маршрутизатор фронтенда сам
    /// пускает на любой экран.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Screen::Home | Screen::Login | Screen::Signup)
    }
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    #[default]
    Free,
    Premium,
    Enterprise,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AppointmentKind {
    Video,
    InPerson,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub doctor_id: String,
    pub doctor_name: String,
    pub date: String,
    pub time: String,
    #[serde(rename = "type")]
    pub kind: AppointmentKind,
    pub status: AppointmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Частичное обновление записи: меняются только заданные поля
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentUpdate {
    pub doctor_id: Option<String>,
    pub doctor_name: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<AppointmentKind>,
    pub status: Option<AppointmentStatus>,
    pub notes: Option<String>,
}

impl Appointment {
    fn apply(&mut self, update: AppointmentUpdate) {
        if let Some(doctor_id) = update.doctor_id {
            self.doctor_id = doctor_id;
        }
        if let Some(doctor_name) = update.doctor_name {
            self.doctor_name = doctor_name;
        }
        if let Some(date) = update.date {
            self.date = date;
        }
        if let Some(time) = update.time {
            self.time = time;
        }
        if let Some(kind) = update.kind {
            self.kind = kind;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if update.notes.is_some() {
            self.notes = update.notes;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BloodPressure {
    pub systolic: Vec<f64>,
    pub diastolic: Vec<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthData {
    pub weight: Vec<f64>,
    pub blood_pressure: BloodPressure,
    pub heart_rate: Vec<f64>,
    pub dates: Vec<String>,
}

/// Заданные ряды целиком заменяют текущие
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthDataUpdate {
    pub weight: Option<Vec<f64>>,
    pub blood_pressure: Option<BloodPressure>,
    pub heart_rate: Option<Vec<f64>>,
    pub dates: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AiDiagnosis {
    pub id: String,
    pub date: String,
    pub symptoms: Vec<String>,
    pub diagnosis: String,
    pub confidence: f64,
    pub recommendations: Vec<String>,
    pub paid: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub subscription: Subscription,
    #[serde(default)]
    pub health_data: HealthData,
    #[serde(default)]
    pub appointments: Vec<Appointment>,
    #[serde(default)]
    pub ai_diagnoses: Vec<AiDiagnosis>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            subscription: Subscription::default(),
            health_data: HealthData::default(),
            appointments: Vec::new(),
            ai_diagnoses: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub user: Option<User>,
    pub is_authenticated: bool,
    pub current_screen: Screen,
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    state: AppState,
    version: u32,
}

#[derive(Debug, Default)]
pub struct AppStore {
    state: AppState,
}

impl AppStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Восстанавливает состояние из снимка [`AppStore::snapshot`]
    pub fn restore(snapshot: &str) -> Result<Self, StoreError> {
        let persisted: Persisted = serde_json::from_str(snapshot).map_err(StoreError::Restore)?;
        if persisted.version != SNAPSHOT_VERSION {
            return Err(StoreError::Version(persisted.version));
        }
        Ok(Self {
            state: persisted.state,
        })
    }

    pub fn snapshot(&self) -> Result<String, StoreError> {
        serde_json::to_string(&Persisted {
            state: self.state.clone(),
            version: SNAPSHOT_VERSION,
        })
        .map_err(StoreError::Serialize)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn current_screen(&self) -> Screen {
        self.state.current_screen
    }

    pub fn set_user(&mut self, user: Option<User>) {
        self.state.user = user;
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.state.is_authenticated = authenticated;
    }

    /// Переход на экран; без входа закрытые экраны ведут на `login`.
    /// Возвращает экран, который реально открыт.
    pub fn navigate(&mut self, screen: Screen) -> Screen {
        let target = if screen.requires_auth() && !self.state.is_authenticated {
            tracing::debug!(requested = %screen, "screen requires sign-in, redirecting to login");
            Screen::Login
        } else {
            screen
        };
        self.state.current_screen = target;
        target
    }

    /// Успешный вход или регистрация
    pub fn login_succeeded(&mut self, user: Option<User>) -> Screen {
        if user.is_some() {
            self.state.user = user;
        }
        self.set_authenticated(true);
        self.navigate(Screen::Onboarding)
    }

    pub fn logout(&mut self) -> Screen {
        self.set_authenticated(false);
        self.navigate(Screen::Home)
    }

    /// `false`, если пользователя нет
    pub fn add_appointment(&mut self, appointment: Appointment) -> bool {
        match self.state.user.as_mut() {
            Some(user) => {
                user.appointments.push(appointment);
                true
            }
            None => false,
        }
    }

    /// `false`, если пользователя или записи с таким id нет
    pub fn update_appointment(&mut self, id: &str, update: AppointmentUpdate) -> bool {
        let appointment = self
            .state
            .user
            .as_mut()
            .and_then(|user| user.appointments.iter_mut().find(|a| a.id == id));
        match appointment {
            Some(appointment) => {
                appointment.apply(update);
                true
            }
            None => false,
        }
    }

    pub fn add_health_data(&mut self, update: HealthDataUpdate) -> bool {
        let Some(user) = self.state.user.as_mut() else {
            return false;
        };
        let data = &mut user.health_data;
        if let Some(weight) = update.weight {
            data.weight = weight;
        }
        if let Some(blood_pressure) = update.blood_pressure {
            data.blood_pressure = blood_pressure;
        }
        if let Some(heart_rate) = update.heart_rate {
            data.heart_rate = heart_rate;
        }
        if let Some(dates) = update.dates {
            data.dates = dates;
        }
        true
    }

    pub fn add_ai_diagnosis(&mut self, diagnosis: AiDiagnosis) -> bool {
        match self.state.user.as_mut() {
            Some(user) => {
                user.ai_diagnoses.push(diagnosis);
                true
            }
            None => false,
        }
    }

    pub fn update_subscription(&mut self, subscription: Subscription) -> bool {
        match self.state.user.as_mut() {
            Some(user) => {
                user.subscription = subscription;
                true
            }
            None => false,
        }
    }
}

/// Снимок в том виде, в каком его хранит фронтенд (localStorage)
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub key: &'static str,
    pub value: String,
}

/// [`AppStore`] под блокировкой, сохраняемый в `<dir>/mediconnect-storage.json`
pub struct SharedStore {
    store: Mutex<AppStore>,
    path: Option<PathBuf>,
}

impl SharedStore {
    /// Без файла: состояние живёт до перезапуска
    pub fn in_memory() -> Self {
        Self {
            store: Mutex::new(AppStore::new()),
            path: None,
        }
    }

    /// Поднимает сохранённое состояние из `dir`. Нет файла или он
    /// испорчен: начинаем с пустого состояния.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(format!("{STORAGE_KEY}.json"));
        let store = match fs::read_to_string(&path) {
            Ok(raw) => AppStore::restore(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "stored app state ignored");
                AppStore::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => AppStore::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read app state");
                AppStore::new()
            }
        };
        tracing::debug!(path = %path.display(), screen = %store.current_screen(), "app state loaded");

        Self {
            store: Mutex::new(store),
            path: Some(path),
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&AppStore) -> T) -> T {
        f(&self.store.lock())
    }

    /// Меняет состояние и сразу сохраняет его. Ошибка записи только
    /// логируется: состояние в памяти уже обновлено.
    pub fn update<T>(&self, f: impl FnOnce(&mut AppStore) -> T) -> T {
        let mut store = self.store.lock();
        let result = f(&mut store);
        if let Err(e) = self.persist(&store) {
            tracing::warn!(error = %e, "failed to persist app state");
        }
        result
    }

    pub fn export(&self) -> Result<StoredSnapshot, StoreError> {
        Ok(StoredSnapshot {
            key: STORAGE_KEY,
            value: self.store.lock().snapshot()?,
        })
    }

    /// Заменяет состояние снимком, например из localStorage фронтенда
    pub fn import(&self, snapshot: &str) -> Result<AppState, StoreError> {
        let restored = AppStore::restore(snapshot)?;
        let state = restored.state().clone();
        let mut store = self.store.lock();
        *store = restored;
        self.persist(&store)?;
        Ok(state)
    }

    fn persist(&self, store: &AppStore) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        // пишем рядом и переименовываем, чтобы не оставить половину файла
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, store.snapshot()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

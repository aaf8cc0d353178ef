pub mod app_config;
pub mod database;
pub mod booking_repo;
pub mod history_repo;
pub mod customer_repo;
pub mod referral_repo;
pub mod redis_repo;
pub mod events;
pub mod notify;
pub mod memory;

pub use database::DbClient;
pub use booking_repo::PgBookingRepository;
pub use history_repo::PgHistoryRepository;
pub use customer_repo::PgCustomerRepository;
pub use referral_repo::PgReferralRepository;
pub use redis_repo::RedisClient;
pub use events::EventProducer;
pub use notify::EventNotifier;
pub use memory::InMemoryStore;

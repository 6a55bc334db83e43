//! Wires stores, supervisors and periodic jobs into one service runtime.

use std::sync::Arc;
use std::time::Duration;

use common::{SharedClock, SystemClock, WorkerPool};
use outbox::{EventPublisher, EventPublisherBuilder};
use record_store::{SagaRepository, Stores, run_migrations};
use saga::{SagaDefinition, SagaStateMachine, SagaSupervisor, SagaSupervisorBuilder};
use scheduler::{
    ArchiveSweep, EventSweep, PartitionRotation, SagaSweep, Scheduler, TaskSweep,
};
use sqlx::postgres::PgPoolOptions;
use task::{TaskHandler, TaskRegistry, TaskRunner, TaskSupervisor};

use crate::config::Config;
use crate::error::StartupError;

type EventSetup = Box<dyn FnOnce(EventPublisherBuilder) -> EventPublisherBuilder + Send>;

type SagaSetup = Box<
    dyn FnOnce(
            SagaSupervisorBuilder,
            &str,
            Arc<dyn SagaRepository>,
            SharedClock,
        ) -> saga::Result<SagaSupervisorBuilder>
        + Send,
>;

/// Opens the stores selected by `config`.
///
/// With a `DATABASE_URL` the PostgreSQL stores are used and migrations are
/// applied; without one everything lives in memory.
pub async fn connect_stores(config: &Config) -> Result<Stores, StartupError> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, records are kept in memory only");
        return Ok(Stores::in_memory());
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.worker_pool_size as u32 + 4)
        .connect(url)
        .await?;
    run_migrations(&pool).await?;
    tracing::info!("connected to PostgreSQL, migrations applied");
    Ok(Stores::postgres(pool)?)
}

/// Everything a service needs to submit and recover durable work.
#[derive(Clone)]
pub struct Runtime {
    pub service_name: String,
    pub stores: Stores,
    pub clock: SharedClock,
    pub pool: WorkerPool,
    pub tasks: TaskSupervisor,
    pub events: EventPublisher,
    pub sagas: SagaSupervisor,
    pub scheduler: Scheduler,
}

impl Runtime {
    pub fn builder(config: Config, stores: Stores) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            stores,
            clock: Arc::new(SystemClock),
            tasks: TaskRegistry::new(),
            events: Vec::new(),
            sagas: Vec::new(),
        }
    }

    /// Waits up to `grace` for in-flight handlers, then drops the rest.
    /// Dropped records stay due in storage.
    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }
}

/// Collects handlers, subscribers and saga definitions before assembly.
pub struct RuntimeBuilder {
    config: Config,
    stores: Stores,
    clock: SharedClock,
    tasks: TaskRegistry,
    events: Vec<EventSetup>,
    sagas: Vec<SagaSetup>,
}

impl RuntimeBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a task handler. Fails if its kind is already taken.
    pub fn task<H: TaskHandler>(mut self, handler: H) -> Result<Self, StartupError> {
        self.tasks.register(handler)?;
        Ok(self)
    }

    /// Adds routes, subscribers or a transport to the event publisher.
    pub fn events(
        mut self,
        configure: impl FnOnce(EventPublisherBuilder) -> EventPublisherBuilder + Send + 'static,
    ) -> Self {
        self.events.push(Box::new(configure));
        self
    }

    /// Registers a saga type. Its process graph is validated in [`Self::build`].
    pub fn saga<D: SagaDefinition>(mut self, definition: D) -> Self {
        self.sagas
            .push(Box::new(move |builder, service_name, repo, clock| {
                let machine = SagaStateMachine::new(definition, service_name, repo, clock)?;
                Ok(builder.register(machine))
            }));
        self
    }

    pub fn build(self) -> Result<Runtime, StartupError> {
        let Self {
            config,
            stores,
            clock,
            tasks,
            events,
            sagas,
        } = self;
        let service = config.service_name.clone();
        let pool = WorkerPool::new(format!("{service}-workers"), config.worker_pool_size);

        let runner = TaskRunner::new(Arc::clone(&stores.tasks), Arc::new(tasks), pool.clone());
        let task_supervisor = TaskSupervisor::new(&service, runner.clone(), Arc::clone(&clock))
            .with_near_immediate(config.near_immediate);

        let publisher = events.into_iter().fold(
            EventPublisher::builder(
                &service,
                Arc::clone(&stores.events),
                pool.clone(),
                Arc::clone(&clock),
            ),
            |builder, configure| configure(builder),
        );
        let publisher = publisher.build();

        let mut saga_builder = SagaSupervisor::builder(pool.clone());
        for register in sagas {
            saga_builder = register(
                saga_builder,
                &service,
                Arc::clone(&stores.sagas),
                Arc::clone(&clock),
            )?;
        }
        let saga_supervisor = saga_builder.build()?;

        let settings = &config.scheduler;
        let scheduler = Scheduler::new()
            .with_job(TaskSweep::for_tasks(
                &service,
                settings.task.clone(),
                runner,
                Arc::clone(&stores.locks),
                Arc::clone(&clock),
            ))
            .with_job(EventSweep::for_events(
                settings.event.clone(),
                publisher.clone(),
                Arc::clone(&stores.locks),
                Arc::clone(&clock),
            ))
            .with_job(SagaSweep::compensation(
                &service,
                settings.saga.clone(),
                Arc::clone(&stores.sagas),
                saga_supervisor.clone(),
                Arc::clone(&stores.locks),
                Arc::clone(&clock),
            ))
            .with_job(SagaSweep::rollback(
                &service,
                settings.saga.clone(),
                Arc::clone(&stores.sagas),
                saga_supervisor.clone(),
                Arc::clone(&stores.locks),
                Arc::clone(&clock),
            ))
            .with_job(ArchiveSweep::new(
                &service,
                settings.archive.clone(),
                Arc::clone(&stores.tasks),
                Arc::clone(&stores.events),
                Arc::clone(&stores.sagas),
                Arc::clone(&stores.locks),
                Arc::clone(&clock),
            ))
            .with_job(PartitionRotation::new(
                &service,
                settings.partition_interval,
                Arc::clone(&stores.partitions),
                Arc::clone(&stores.locks),
                Arc::clone(&clock),
            ));

        tracing::info!(
            service = %service,
            task_kinds = ?task_supervisor.runner().registry().kinds(),
            saga_types = ?saga_supervisor.supported_saga_types(),
            "runtime assembled"
        );

        Ok(Runtime {
            service_name: service,
            stores,
            clock,
            pool,
            tasks: task_supervisor,
            events: publisher,
            sagas: saga_supervisor,
            scheduler,
        })
    }
}
